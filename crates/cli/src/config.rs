//! Command line and environment configuration.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use subsync_cis::CisEndpointConfig;
use subsync_ops::steps::StepTimes;
use subsync_ops::StagedManagerConfig;
use subsync_reconciler::SyncConfig;

#[derive(Parser, Debug)]
#[command(name = "subsync", version, about = "Keeps runtime labels in line with CIS subaccount state")]
pub struct Cli {
    /// Log level or tracing filter directives
    #[arg(long, env = "APP_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Port of the Prometheus endpoint
    #[arg(long, env = "APP_METRICS_PORT", default_value_t = 8081, global = true)]
    pub metrics_port: u16,

    /// SQLite database file
    #[arg(long, env = "APP_DATABASE_PATH", default_value = "subsync.db", global = true)]
    pub database_path: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the subaccount sync engine
    Sync(SyncArgs),
    /// Run the staged operation workers
    Operations(OperationsArgs),
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub accounts: CisAccountsArgs,
    #[command(flatten)]
    pub events: CisEventsArgs,

    /// Write labels to runtime resources; off means dry run
    #[arg(long, env = "APP_UPDATE_RESOURCES", default_value_t = false)]
    pub update_resources: bool,
    #[arg(long, env = "APP_EVENTS_WINDOW_SIZE", default_value = "20m", value_parser = humantime::parse_duration)]
    pub events_window_size: Duration,
    #[arg(long, env = "APP_EVENTS_WINDOW_INTERVAL", default_value = "15m", value_parser = humantime::parse_duration)]
    pub events_window_interval: Duration,
    #[arg(long, env = "APP_ACCOUNTS_SYNC_INTERVAL", default_value = "24h", value_parser = humantime::parse_duration)]
    pub accounts_sync_interval: Duration,
    #[arg(long, env = "APP_STORAGE_SYNC_INTERVAL", default_value = "10m", value_parser = humantime::parse_duration)]
    pub storage_sync_interval: Duration,
    #[arg(long, env = "APP_SYNC_QUEUE_SLEEP_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    pub sync_queue_sleep_interval: Duration,
    /// Resolve subaccounts through the instances table instead of resource labels
    #[arg(long, env = "APP_ALWAYS_SUBACCOUNT_FROM_DATABASE", default_value_t = false)]
    pub always_subaccount_from_database: bool,
    #[arg(long, env = "APP_RESOURCE_NAMESPACE", default_value = "kcp-system")]
    pub resource_namespace: String,
    #[arg(long, env = "APP_RESOURCE_GVK", default_value = "operator.kyma-project.io/v1beta2/Kyma")]
    pub resource_gvk: String,
}

/// CIS accounts endpoint.
#[derive(Args, Debug)]
pub struct CisAccountsArgs {
    #[arg(id = "cis_accounts_client_id", long = "cis-accounts-client-id", env = "APP_CIS_ACCOUNTS_CLIENT_ID", default_value = "")]
    pub client_id: String,
    #[arg(id = "cis_accounts_client_secret", long = "cis-accounts-client-secret", env = "APP_CIS_ACCOUNTS_CLIENT_SECRET", default_value = "", hide_env_values = true)]
    pub client_secret: String,
    #[arg(id = "cis_accounts_auth_url", long = "cis-accounts-auth-url", env = "APP_CIS_ACCOUNTS_AUTH_URL", default_value = "")]
    pub auth_url: String,
    #[arg(id = "cis_accounts_service_url", long = "cis-accounts-service-url", env = "APP_CIS_ACCOUNTS_SERVICE_URL", default_value = "")]
    pub service_url: String,
    #[arg(id = "cis_accounts_page_size", long = "cis-accounts-page-size", env = "APP_CIS_ACCOUNTS_PAGE_SIZE", default_value_t = 150)]
    pub page_size: u32,
    #[arg(id = "cis_accounts_rate_limiting_interval", long = "cis-accounts-rate-limiting-interval", env = "APP_CIS_ACCOUNTS_RATE_LIMITING_INTERVAL", default_value = "2s", value_parser = humantime::parse_duration)]
    pub rate_limiting_interval: Duration,
    #[arg(id = "cis_accounts_max_requests_per_interval", long = "cis-accounts-max-requests-per-interval", env = "APP_CIS_ACCOUNTS_MAX_REQUESTS_PER_INTERVAL", default_value_t = 5)]
    pub max_requests_per_interval: u32,
}

/// CIS events endpoint.
#[derive(Args, Debug)]
pub struct CisEventsArgs {
    #[arg(id = "cis_events_client_id", long = "cis-events-client-id", env = "APP_CIS_EVENTS_CLIENT_ID", default_value = "")]
    pub client_id: String,
    #[arg(id = "cis_events_client_secret", long = "cis-events-client-secret", env = "APP_CIS_EVENTS_CLIENT_SECRET", default_value = "", hide_env_values = true)]
    pub client_secret: String,
    #[arg(id = "cis_events_auth_url", long = "cis-events-auth-url", env = "APP_CIS_EVENTS_AUTH_URL", default_value = "")]
    pub auth_url: String,
    #[arg(id = "cis_events_service_url", long = "cis-events-service-url", env = "APP_CIS_EVENTS_SERVICE_URL", default_value = "")]
    pub service_url: String,
    #[arg(id = "cis_events_page_size", long = "cis-events-page-size", env = "APP_CIS_EVENTS_PAGE_SIZE", default_value_t = 150)]
    pub page_size: u32,
    #[arg(id = "cis_events_rate_limiting_interval", long = "cis-events-rate-limiting-interval", env = "APP_CIS_EVENTS_RATE_LIMITING_INTERVAL", default_value = "2s", value_parser = humantime::parse_duration)]
    pub rate_limiting_interval: Duration,
    #[arg(id = "cis_events_max_requests_per_interval", long = "cis-events-max-requests-per-interval", env = "APP_CIS_EVENTS_MAX_REQUESTS_PER_INTERVAL", default_value_t = 5)]
    pub max_requests_per_interval: u32,
}

fn endpoint(
    client_id: String,
    client_secret: String,
    auth_url: String,
    service_url: String,
    page_size: u32,
    rate_limiting_interval: Duration,
    max_requests_per_interval: u32,
) -> CisEndpointConfig {
    CisEndpointConfig {
        client_id,
        client_secret,
        auth_url,
        service_url,
        page_size,
        rate_limiting_interval,
        max_requests_per_interval,
        ..Default::default()
    }
}

impl From<CisAccountsArgs> for CisEndpointConfig {
    fn from(a: CisAccountsArgs) -> Self {
        endpoint(a.client_id, a.client_secret, a.auth_url, a.service_url, a.page_size, a.rate_limiting_interval, a.max_requests_per_interval)
    }
}

impl From<CisEventsArgs> for CisEndpointConfig {
    fn from(a: CisEventsArgs) -> Self {
        endpoint(a.client_id, a.client_secret, a.auth_url, a.service_url, a.page_size, a.rate_limiting_interval, a.max_requests_per_interval)
    }
}

impl From<SyncArgs> for SyncConfig {
    fn from(a: SyncArgs) -> Self {
        SyncConfig {
            cis_accounts: a.accounts.into(),
            cis_events: a.events.into(),
            update_resources: a.update_resources,
            events_window_size: a.events_window_size,
            events_window_interval: a.events_window_interval,
            accounts_sync_interval: a.accounts_sync_interval,
            storage_sync_interval: a.storage_sync_interval,
            sync_queue_sleep_interval: a.sync_queue_sleep_interval,
            always_subaccount_from_database: a.always_subaccount_from_database,
            resource_namespace: a.resource_namespace,
            resource_gvk: a.resource_gvk,
        }
    }
}

#[derive(Args, Debug)]
pub struct OperationsArgs {
    #[arg(long, env = "APP_MAX_STEP_PROCESSING_TIME", default_value = "2m", value_parser = humantime::parse_duration)]
    pub max_step_processing_time: Duration,
    /// Workers per operation kind
    #[arg(long, env = "APP_WORKERS_AMOUNT", default_value_t = 20)]
    pub workers_amount: usize,
    #[arg(long, env = "APP_PROVISIONING_TIMEOUT", default_value = "6h", value_parser = humantime::parse_duration)]
    pub provisioning_timeout: Duration,
    #[arg(long, env = "APP_DEPROVISIONING_TIMEOUT", default_value = "5h", value_parser = humantime::parse_duration)]
    pub deprovisioning_timeout: Duration,
    #[arg(long, env = "APP_WORKER_HEALTH_CHECK_INTERVAL", default_value = "10m", value_parser = humantime::parse_duration)]
    pub worker_health_check_interval: Duration,
    #[arg(long, env = "APP_WORKER_HEALTH_CHECK_WARN_AFTER", default_value = "10m", value_parser = humantime::parse_duration)]
    pub worker_health_check_warn_after: Duration,
    /// Unfinished operations created within this window are resumed at startup
    #[arg(long, env = "APP_OPERATIONS_LOOKBACK", default_value = "24h", value_parser = humantime::parse_duration)]
    pub operations_lookback: Duration,
    #[arg(long, env = "APP_OPERATION_STATS_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub operation_stats_interval: Duration,
    #[arg(long, env = "APP_CLUSTER_DRIVER_URL", default_value = "http://localhost:8080")]
    pub cluster_driver_url: String,
    #[arg(long, env = "APP_CLUSTER_DRIVER_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub cluster_driver_timeout: Duration,
}

impl OperationsArgs {
    pub fn manager_config(&self) -> StagedManagerConfig {
        StagedManagerConfig { max_step_processing_time: self.max_step_processing_time, workers_amount: self.workers_amount }
    }

    pub fn step_times(&self) -> StepTimes { StepTimes::default() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_sync_config() {
        let cli = Cli::try_parse_from(["subsync", "sync"]).unwrap();
        let Command::Sync(args) = cli.command else { panic!("expected sync") };
        let cfg: SyncConfig = args.into();
        let want = SyncConfig::default();
        assert_eq!(cfg.events_window_size, want.events_window_size);
        assert_eq!(cfg.events_window_interval, want.events_window_interval);
        assert_eq!(cfg.accounts_sync_interval, want.accounts_sync_interval);
        assert_eq!(cfg.storage_sync_interval, want.storage_sync_interval);
        assert_eq!(cfg.sync_queue_sleep_interval, want.sync_queue_sleep_interval);
        assert_eq!(cfg.resource_namespace, want.resource_namespace);
        assert_eq!(cfg.resource_gvk, want.resource_gvk);
        assert_eq!(cfg.cis_events.page_size, 150);
        assert!(!cfg.update_resources);
        assert_eq!(cli.metrics_port, 8081);
    }

    #[test]
    fn durations_use_humantime() {
        let cli = Cli::try_parse_from(["subsync", "operations", "--max-step-processing-time", "90s", "--workers-amount", "3"]).unwrap();
        let Command::Operations(args) = cli.command else { panic!("expected operations") };
        let cfg = args.manager_config();
        assert_eq!(cfg.max_step_processing_time, Duration::from_secs(90));
        assert_eq!(cfg.workers_amount, 3);
        assert_eq!(args.provisioning_timeout, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn bad_duration_is_rejected() {
        assert!(Cli::try_parse_from(["subsync", "sync", "--events-window-size", "soon"]).is_err());
    }
}
