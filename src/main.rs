//! heimdall - block selected syscalls inside one container's cgroup
//!
//! ```text
//! heimdall -c <container id> -s mount,ptrace
//! heimdall -c <container id> -p -f /etc/shadow,/etc/sudoers
//! heimdall -y filter.yaml --dry-run
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use heimdall::enforcement::{event_channel, EventConsumer};
use heimdall::security::Preflight;
use heimdall::{
    metrics, telemetry, DryRun, EnforcementEvent, EnforcementManager, FilterConfig, FilterPolicy,
    GuardManager,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Container ID to target
    #[arg(short = 'c', long)]
    container_id: Option<String>,

    /// cgroup directory to target, absolute or relative to /sys/fs/cgroup
    #[arg(long)]
    cgroup_path: Option<PathBuf>,

    /// cgroup id to target, used as-is
    #[arg(long)]
    cgroup_id: Option<u64>,

    /// Target the cgroup of this running process
    #[arg(long)]
    pid: Option<u32>,

    /// System calls to block, by name or number (comma separated)
    #[arg(short = 's', long, value_delimiter = ',')]
    block_syscalls: Vec<String>,

    /// Block privilege escalation attempts (setuid/setgid by non-root tasks)
    #[arg(short = 'p', long)]
    block_privilege_escalation: bool,

    /// Absolute file paths to block access to (comma separated)
    #[arg(short = 'f', long = "file-path", value_delimiter = ',')]
    file_paths: Vec<String>,

    /// YAML file with the filter; its non-empty values win over flags
    #[arg(short = 'y', long)]
    yaml: Option<PathBuf>,

    /// Show what would be blocked and exit
    #[arg(long)]
    dry_run: bool,

    /// Print enforcement events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Capacity of the userspace event queue
    #[arg(long, default_value_t = heimdall::DEFAULT_CAPACITY)]
    event_buffer: usize,

    /// Write Prometheus metrics to this file on shutdown
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// OTLP collector endpoint for log and span export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn filter_flags(&self) -> FilterConfig {
        FilterConfig {
            container_id: self.container_id.clone(),
            cgroup_path: self.cgroup_path.clone(),
            cgroup_id: self.cgroup_id,
            pid: self.pid,
            block_syscalls: self.block_syscalls.clone(),
            block_privilege_escalation: self.block_privilege_escalation,
            file_paths: self.file_paths.clone(),
        }
    }

    fn load_config(&self) -> anyhow::Result<FilterConfig> {
        let flags = self.filter_flags();
        match &self.yaml {
            Some(path) => {
                let file = FilterConfig::load(path)
                    .with_context(|| format!("loading {}", path.display()))?;
                Ok(file.or_flags(flags))
            }
            None => Ok(flags),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init_tracing("heimdall", cli.otlp_endpoint.as_deref(), cli.json) {
        eprintln!("failed to initialize logging: {}", e);
    }
    metrics::init();

    let result = run(&cli).await;

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = std::fs::write(path, metrics::render()) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write metrics");
        }
    }
    telemetry::shutdown_tracing();

    result
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    if !config.has_filters() {
        tracing::info!("No filters applied. Exiting");
        return Ok(());
    }

    let policy = config.resolve().context("resolving filter")?;

    if cli.dry_run {
        println!("{}", DryRun(&policy));
        return Ok(());
    }

    Preflight::run(policy.needs_guard()).log();

    let mut syscalls = None;
    if !policy.syscalls.is_empty() {
        let Some(manager) = EnforcementManager::new() else {
            bail!("syscall enforcement is unavailable on this host");
        };
        manager
            .apply_policy(&policy)
            .await
            .context("installing rules")?;
        syscalls = Some(manager);
    }

    let mut guard = None;
    if policy.needs_guard() {
        let Some(manager) = GuardManager::new(&policy) else {
            bail!("file and privilege blocking is unavailable on this host");
        };
        manager
            .apply_policy(&policy)
            .await
            .context("installing guard rules")?;
        guard = Some(manager);
    }

    // Held until shutdown: the consumer must not see the stream end while
    // rules are still installed
    let (producer, consumer) = event_channel(cli.event_buffer);
    if let Some(manager) = syscalls.as_mut() {
        if let Err(e) = manager.start_collector(&producer).await {
            tracing::error!(error = %e, "event collection disabled, rules stay active");
        }
    }

    tracing::info!(
        container_id = policy.container_id.as_deref().unwrap_or("-"),
        cgroup_id = policy.cgroup_id,
        syscalls = policy.syscalls.len(),
        file_paths = policy.file_paths.len(),
        privilege = policy.block_privilege_escalation,
        "enforcing; press Ctrl-C to stop"
    );

    let served = serve_events(consumer, cli.json).await;
    drop(producer);

    let cleared = clear_all(syscalls.as_mut(), guard.as_ref(), &policy).await;
    served.and(cleared)
}

/// Remove every installed rule. Both managers are cleared even if the
/// first fails; the first error is returned.
async fn clear_all(
    syscalls: Option<&mut EnforcementManager>,
    guard: Option<&GuardManager>,
    policy: &FilterPolicy,
) -> anyhow::Result<()> {
    let mut result = Ok(());

    if let Some(manager) = syscalls {
        manager.stop_collector();
        match manager.clear_policy(policy).await {
            Ok(removed) => tracing::info!(removed, "syscall rules removed"),
            Err(e) => result = Err(anyhow::Error::new(e).context("removing rules")),
        }
    }

    if let Some(guard) = guard {
        match guard.denials().await {
            Ok(denials) => {
                metrics::set_denials(&denials);
                tracing::info!(
                    file_open = denials.file_open,
                    privilege = denials.privilege,
                    "guard denials"
                );
            }
            Err(e) => tracing::warn!(error = %e, "failed to read guard denials"),
        }
        match guard.clear_policy(policy).await {
            Ok(removed) => tracing::info!(removed, "guard rules removed"),
            Err(e) => {
                if result.is_ok() {
                    result = Err(anyhow::Error::new(e).context("removing guard rules"));
                }
            }
        }
    }

    if result.is_ok() {
        tracing::info!("rules removed, exiting");
    }
    result
}

/// Report events until Ctrl-C or SIGTERM.
///
/// A closed event stream only ends reporting; rules stay in force until
/// a shutdown signal arrives.
async fn serve_events(mut consumer: EventConsumer, json: bool) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut open = true;

    loop {
        tokio::select! {
            record = consumer.recv(), if open => match record {
                Some(record) => report(&EnforcementEvent::from_record(&record), json),
                None => {
                    open = false;
                    tracing::warn!("event stream closed; still enforcing until Ctrl-C or SIGTERM");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl-C");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                break;
            }
        }
    }

    consumer.close();
    for record in consumer.drain() {
        report(&EnforcementEvent::from_record(&record), json);
    }

    let dropped = consumer.dropped();
    if dropped > 0 {
        tracing::warn!(dropped, "some enforcement events were not delivered");
    }
    Ok(())
}

fn report(event: &EnforcementEvent, json: bool) {
    metrics::record_enforced(event.syscall_nr);
    event.log();
    if json {
        match event.to_json() {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "failed to encode event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_comma_separated_syscalls() {
        let cli = Cli::try_parse_from(["heimdall", "-c", "abc", "-s", "mount,ptrace", "-s", "kill"])
            .unwrap();
        assert_eq!(cli.block_syscalls, vec!["mount", "ptrace", "kill"]);
        assert_eq!(cli.container_id.as_deref(), Some("abc"));
        assert_eq!(cli.event_buffer, heimdall::DEFAULT_CAPACITY);
    }

    #[test]
    fn test_yaml_merged_over_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.yaml");
        std::fs::write(&path, "container_id: from-yaml\n").unwrap();

        let cli = Cli::try_parse_from([
            "heimdall",
            "-c",
            "from-flag",
            "-s",
            "mount",
            "-y",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.container_id.as_deref(), Some("from-yaml"));
        assert_eq!(config.block_syscalls, vec!["mount"]);
    }

    #[test]
    fn test_dry_run_policy_text() {
        let cli = Cli::try_parse_from(["heimdall", "--cgroup-id", "77", "-s", "62", "--dry-run"])
            .unwrap();
        let policy: FilterPolicy = cli.load_config().unwrap().resolve().unwrap();
        assert!(cli.dry_run);
        assert!(DryRun(&policy).to_string().contains("Block system call: kill (Number: 62)"));
    }

    #[test]
    fn test_guard_flags() {
        let cli = Cli::try_parse_from([
            "heimdall",
            "--pid",
            "4242",
            "-p",
            "-f",
            "/etc/shadow,/etc/sudoers",
            "--file-path",
            "/root/.ssh/id_rsa",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();

        assert_eq!(config.pid, Some(4242));
        assert!(config.block_privilege_escalation);
        assert_eq!(
            config.file_paths,
            vec!["/etc/shadow", "/etc/sudoers", "/root/.ssh/id_rsa"]
        );
        assert!(config.block_syscalls.is_empty());
        assert!(config.has_filters());
    }

    #[test]
    fn test_no_filters() {
        let cli = Cli::try_parse_from(["heimdall", "-c", "abc"]).unwrap();
        assert!(!cli.load_config().unwrap().has_filters());
    }

    #[test]
    fn test_yaml_guard_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.yaml");
        std::fs::write(
            &path,
            "cgroup_id: 77\nblock_privilege_escalation: true\nfile_paths: [/etc/shadow]\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "heimdall",
            "-f",
            "/etc/passwd",
            "-y",
            path.to_str().unwrap(),
            "--dry-run",
        ])
        .unwrap();
        let policy = cli.load_config().unwrap().resolve().unwrap();
        let text = DryRun(&policy).to_string();

        assert!(text.contains("Block privilege escalation attempts"));
        assert!(text.contains("Block file access for paths: [/etc/shadow]"));
    }

    #[tokio::test]
    async fn test_serve_events_outlives_closed_stream() {
        let (producer, consumer) = event_channel(4);
        drop(producer);

        let served =
            tokio::time::timeout(Duration::from_millis(300), serve_events(consumer, false)).await;
        assert!(served.is_err(), "serving stopped before any shutdown signal");
    }
}
