use node_monitoring::{
    MonitorOptions, NodeMonitor, NodeMonitorConfig, PrimarySecondaryMonitor, RemoteNodeState, Role,
};
use slog::Drain;
use std::error::Error;
use std::net::IpAddr;
use std::sync::Arc;

// Usage: node-monitoring <my-identity> <port> <member>...
//
// Identities double as host addresses. Binding to the identity lets several nodes share one
// machine on distinct loopback addresses, e.g. 127.0.0.1, 127.0.0.2, 127.0.0.3.
fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let my_identity = args.next().ok_or("missing <my-identity>")?;
    let port: u16 = args.next().ok_or("missing <port>")?.parse()?;
    let mut cluster_members: Vec<String> = args.collect();
    if !cluster_members.contains(&my_identity) {
        cluster_members.push(my_identity.clone());
    }

    let logger = create_root_logger_for_stdout(my_identity.clone());
    let bind_ip = my_identity.parse::<IpAddr>().ok();

    let state_logger = logger.clone();
    let monitor = Arc::new(NodeMonitor::new(NodeMonitorConfig {
        my_identity,
        cluster_members,
        port,
        logger: logger.clone(),
        options: MonitorOptions {
            bind_ip,
            local_ip: bind_ip,
            ..MonitorOptions::default()
        },
        node_state_change_handler: Some(Arc::new(
            move |node: &str, state: RemoteNodeState, last_seen_millis: i64| {
                slog::info!(state_logger, "{} is {}", node, state; "last_seen_millis" => last_seen_millis);
            },
        )),
        message_handlers: vec![],
    })?);
    monitor.start(false)?;

    let role_logger = logger.clone();
    let _election = PrimarySecondaryMonitor::new(
        monitor.clone(),
        Arc::new(move |role: Role| slog::info!(role_logger, "Now {}", role)),
    )?;

    monitor.wait_for_exit();
    Ok(())
}

fn create_root_logger_for_stdout(node: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("Node" => node))
}
