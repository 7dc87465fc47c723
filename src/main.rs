use clap::{Arg, ArgAction, Command};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

use deimos::{
    cluster::{ClusterCoordinator, MemoryBroker},
    config::{EngineConfig, NodeConfig, TaskConfig},
    network::transport::{SimulatedPort, SimulatedTransport},
    network::{PortState, ScanTechnique},
    scanner::{ProbeEngine, ScanResult, TechniqueExecutor},
    task::{JsonLinesSink, TaskManager, TaskReport, TaskStatus},
    utils::{port_parser::parse_ports, Logger, MemoryMonitor},
};

// Ulimit adjustment for Unix systems
#[cfg(unix)]
fn adjust_ulimit_size(ulimit: Option<u64>) -> u64 {
    use rlimit::Resource;

    if let Some(limit) = ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            println!(
                "{} {}",
                "[~] Raising file descriptor limit to".bright_blue(),
                limit.to_string().bright_cyan().bold()
            );
        } else {
            eprintln!("{}", "[!] Failed to set file descriptor limit".bright_red());
        }
    }

    match Resource::NOFILE.get() {
        Ok((soft, _)) => soft,
        Err(_) => {
            eprintln!("{}", "[!] Could not read file descriptor limit".bright_yellow());
            65535
        }
    }
}

#[cfg(not(unix))]
fn adjust_ulimit_size(_ulimit: Option<u64>) -> u64 {
    65535
}

fn print_banner() {
    println!("{}", " ____  _____ ___ __  __  ___  ____  ".truecolor(192, 57, 43).bold());
    println!("{}", "|  _ \\| ____|_ _|  \\/  |/ _ \\/ ___| ".truecolor(192, 57, 43).bold());
    println!("{}", "| | | |  _|  | || |\\/| | | | \\___ \\ ".truecolor(192, 57, 43).bold());
    println!("{}", "| |_| | |___ | || |  | | |_| |___) |".truecolor(192, 57, 43).bold());
    println!("{}", "|____/|_____|___|_|  |_|\\___/|____/ ".truecolor(192, 57, 43).bold());
    println!();
    println!(
        "{}",
        format!("Deimos {} ({}) - distributed scanning core", env!("CARGO_PKG_VERSION"), env!("DEIMOS_TARGET"))
            .truecolor(255, 215, 0)
    );
    println!();
}

fn build_cli() -> Command {
    Command::new("deimos")
        .version(env!("CARGO_PKG_VERSION"))
        .author("ibrahimsql")
        .about("Deimos: distributed port scanner with adaptive rate control")
        .arg(
            Arg::new("target")
                .value_name("TARGET")
                .help("Targets to scan (IP, hostname, CIDR; comma separated)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("ports")
                .short('p')
                .long("ports")
                .value_name("PORTS")
                .help("Ports to scan, e.g. 22,80,1000-2000"),
        )
        .arg(
            Arg::new("technique")
                .short('s')
                .long("technique")
                .value_name("TECHNIQUE")
                .help("connect, syn, ack, fin, null, xmas or udp"),
        )
        .arg(
            Arg::new("preset")
                .long("preset")
                .value_name("NAME")
                .help("Task preset: default, fast, full, stealth"),
        )
        .arg(
            Arg::new("nodes")
                .long("nodes")
                .value_name("N")
                .help("Worker nodes in the local cluster")
                .value_parser(clap::value_parser!(usize))
                .default_value("2"),
        )
        .arg(
            Arg::new("pool-size")
                .long("pool-size")
                .value_name("SIZE")
                .help("Concurrent probes per worker node")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("concurrency")
                .short('c')
                .long("concurrency")
                .value_name("JOBS")
                .help("Jobs of the task outstanding across the cluster")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MS")
                .help("Per-probe timeout in milliseconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("retries")
                .long("retries")
                .value_name("N")
                .help("Retries for probes that end in error")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("rate-limit")
                .long("rate-limit")
                .value_name("PPS")
                .help("Upper bound of the adaptive probe rate per node")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("no-service")
                .long("no-service")
                .help("Skip banner grabbing and service detection")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .value_name("NAME")
                .help("Task name used in logs and the result table"),
        )
        .arg(
            Arg::new("save")
                .long("save")
                .value_name("NAME")
                .conflicts_with("output")
                .help("Append results to ~/.deimos/results/NAME.jsonl"),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .value_name("OPEN_PORTS")
                .help("Dry run against a simulated host answering on the given ports"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Append results as JSON lines"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default ~/.deimos.toml)"),
        )
        .arg(
            Arg::new("ulimit")
                .short('u')
                .long("ulimit")
                .value_name("LIMIT")
                .help("Raise the file descriptor limit")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("all")
                .short('a')
                .long("all")
                .help("Show every port state, not just open ones")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-banner")
                .long("no-banner")
                .help("Hide the banner")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Verbose logging (repeat for debug)")
                .action(ArgAction::Count),
        )
}

fn task_config(matches: &clap::ArgMatches, engine: &EngineConfig) -> anyhow::Result<TaskConfig> {
    let mut task = match matches.get_one::<String>("preset") {
        Some(name) => TaskConfig::preset(name)?,
        None => engine.task.clone(),
    };

    if let Some(name) = matches.get_one::<String>("name") {
        task = task.with_name(name.as_str());
    }
    if let Some(target) = matches.get_one::<String>("target") {
        task = task.with_targets(vec![target.clone()]);
    }
    if let Some(ports) = matches.get_one::<String>("ports") {
        task = task.with_ports(ports.as_str());
    }
    if let Some(technique) = matches.get_one::<String>("technique") {
        task = task.with_technique(technique.parse::<ScanTechnique>()?);
    }
    if let Some(&concurrency) = matches.get_one::<usize>("concurrency") {
        task = task.with_concurrency(concurrency);
    }
    if let Some(&timeout) = matches.get_one::<u64>("timeout") {
        task = task.with_timeout(timeout);
    }
    if let Some(&retries) = matches.get_one::<u32>("retries") {
        task = task.with_retries(retries);
    }
    if matches.get_flag("no-service") {
        task = task.with_service_detection(false).with_banner_grab(false);
    }
    Ok(task)
}

fn executor(simulate: Option<&String>, banner_timeout: Duration) -> anyhow::Result<Arc<dyn TechniqueExecutor>> {
    let Some(open_ports) = simulate else {
        return Ok(Arc::new(ProbeEngine::system().with_banner_timeout(banner_timeout)));
    };

    let mut transport = SimulatedTransport::rst_on_all().with_latency(Duration::from_millis(2));
    for port in parse_ports(open_ports)? {
        let banner = match port {
            21 => Some(b"220 (vsFTPd 3.0.5)\r\n".to_vec()),
            22 => Some(b"SSH-2.0-OpenSSH_9.6\r\n".to_vec()),
            25 => Some(b"220 mail.example ESMTP Postfix\r\n".to_vec()),
            _ => None,
        };
        transport = transport.with_port(port, SimulatedPort::Open { banner });
    }
    Ok(Arc::new(ProbeEngine::new(Arc::new(transport)).with_banner_timeout(banner_timeout)))
}

fn print_results(report: &TaskReport, results: &[ScanResult], show_all: bool) {
    println!();
    println!(
        "{} {} {}",
        "Task".bright_white().bold(),
        report.name.bright_cyan(),
        format!("[{}]", report.status).bright_blue()
    );

    let shown: Vec<&ScanResult> = results
        .iter()
        .filter(|r| show_all || r.is_open() || r.state == PortState::OpenFiltered)
        .collect();

    if shown.is_empty() {
        println!("No open ports found.");
    } else {
        println!(
            "{:<18} {:<10} {:<15} {:<14} {}",
            "HOST".bright_white().bold(),
            "PORT".bright_white().bold(),
            "STATE".bright_white().bold(),
            "SERVICE".bright_white().bold(),
            "VERSION".bright_white().bold()
        );
        for result in shown {
            let state = result.state.to_string();
            let state = match result.state {
                PortState::Open => state.bright_green(),
                PortState::Closed => state.bright_red(),
                PortState::Filtered => state.bright_yellow(),
                PortState::OpenFiltered => state.bright_cyan(),
                PortState::Unfiltered => state.bright_white(),
                PortState::Error => state.bright_magenta(),
            };
            println!(
                "{:<18} {:<10} {:<15} {:<14} {}",
                result.target,
                format!("{}/{}", result.port, result.protocol),
                state,
                result.service.as_deref().unwrap_or("unknown").bright_yellow(),
                result.version.as_deref().unwrap_or("")
            );
        }
    }

    let stats = &report.statistics;
    println!();
    println!(
        "{} {} open, {} closed, {} filtered, {} open|filtered, {} unfiltered, {} errors",
        "Summary:".bright_blue().bold(),
        stats.open,
        stats.closed,
        stats.filtered,
        stats.open_filtered,
        stats.unfiltered,
        stats.errors
    );
    println!(
        "{} {}/{} jobs ({:.1}%), avg response {:.1} ms",
        "Progress:".bright_blue().bold(),
        stats.completed_jobs,
        stats.total_jobs,
        report.progress,
        stats.avg_response_time_ms
    );
    if let Some(error) = &report.error {
        println!("{} {}", "Error:".bright_red().bold(), error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    let level = match matches.get_count("verbose") {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    Logger::init(level);

    if !matches.get_flag("no-banner") {
        print_banner();
    }
    let fd_limit = adjust_ulimit_size(matches.get_one::<u64>("ulimit").copied());
    log::debug!("file descriptor limit {}", fd_limit);

    let engine = match matches.get_one::<String>("config") {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::load_default_config(),
    };
    let task = task_config(&matches, &engine)?;

    let mut rate = engine.rate.clone();
    if let Some(&limit) = matches.get_one::<f64>("rate-limit") {
        rate = rate.with_rate_cap(limit);
    }
    rate.validate()?;

    let nodes = (*matches.get_one::<usize>("nodes").unwrap_or(&2)).max(1);
    let mut worker_config = NodeConfig {
        role: deimos::NodeRole::Worker,
        node_id: None,
        ..engine.node.clone()
    };
    if let Some(&pool_size) = matches.get_one::<usize>("pool-size") {
        worker_config = worker_config
            .with_pool_size(pool_size)
            .with_queue_capacity(pool_size * 4)
            .with_dispatch_window(pool_size * 2);
    }
    let executor = executor(matches.get_one::<String>("simulate"), worker_config.banner_timeout())?;

    // One master and N workers sharing an in-process broker
    let broker = Arc::new(MemoryBroker::new());
    let master = Arc::new(ClusterCoordinator::new(
        NodeConfig {
            role: deimos::NodeRole::Master,
            ..worker_config.clone()
        }
        .with_node_id("master"),
        broker.clone(),
    ));
    let results = master
        .take_results()
        .ok_or_else(|| anyhow::anyhow!("master result stream unavailable"))?;
    master.start().await?;

    let mut workers = Vec::with_capacity(nodes);
    for index in 1..=nodes {
        let worker = Arc::new(
            ClusterCoordinator::new(
                worker_config.clone().with_node_id(format!("worker-{}", index)),
                broker.clone(),
            )
            .with_executor(executor.clone())
            .with_rate_config(rate.clone()),
        );
        worker.start().await?;
        workers.push(worker);
    }

    let registry = master.registry();
    let joined = tokio::time::timeout(Duration::from_secs(5), async {
        while registry.online_nodes().len() < nodes {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if joined.is_err() {
        log::warn!("only {} of {} workers registered", registry.online_nodes().len(), nodes);
    }

    let mut manager = TaskManager::new(master.clone());
    if let Some(path) = matches.get_one::<String>("output") {
        manager = manager.with_result_sink(Arc::new(JsonLinesSink::new(path)?));
    } else if let Some(name) = matches.get_one::<String>("save") {
        let sink = JsonLinesSink::in_home(name)?;
        println!("{} {}", "[~] Saving results to".bright_blue(), sink.path().display());
        manager = manager.with_result_sink(Arc::new(sink));
    }
    let manager = Arc::new(manager);
    let ingestion = manager.clone().spawn_ingestion(results);

    let technique = task.technique;
    let task_id = manager.create_task(task)?;
    let total = manager.get_task(task_id)?.total_jobs;
    println!(
        "{} {} jobs across {} worker nodes ({})",
        "[~] Scanning".bright_blue(),
        total.to_string().bright_cyan().bold(),
        nodes,
        technique.description()
    );
    manager.start_task(task_id).await?;

    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.red} [{elapsed_precise}] [{bar:40.red/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let report = loop {
        let report = manager.get_task_status(task_id)?;
        progress.set_position(report.statistics.completed_jobs as u64);
        progress.set_message(format!("{} open", report.statistics.open));
        if report.status.is_terminal() {
            break report;
        }
        tokio::select! {
            _ = manager.changed() => {}
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            _ = tokio::signal::ctrl_c() => {
                progress.println("[!] Interrupted, canceling task");
                manager.cancel_task(task_id).await?;
            }
        }
    };
    progress.finish_and_clear();

    for worker in &workers {
        worker.stop().await?;
    }
    master.stop().await?;
    if let Err(e) = ingestion.await {
        log::error!("ingestion task failed: {}", e);
    }

    // Results that arrived while the workers drained are included
    let report = manager.get_task_status(task_id).unwrap_or(report);
    let results = manager.get_results(task_id)?;
    print_results(&report, &results, matches.get_flag("all"));

    if let Some(bytes) = MemoryMonitor::current_usage() {
        log::info!("memory in use {}", MemoryMonitor::format_bytes(bytes));
    }
    if report.status == TaskStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
