//! CLI command implementations.

pub mod clone;
pub mod parsers;
pub mod serve;
pub mod snapshot;
pub mod vms;

use serde::Serialize;
use snapvisor::config::SnapvisorConfig;
use snapvisor::context::{DispatcherContext, OpContext};
use snapvisor::events::{BroadcastChannel, EventKind};
use snapvisor::vm::SessionId;
use std::io::Write;
use tokio::sync::broadcast::error::RecvError;

/// Dispatcher for a one-shot command, with progress echoed to stderr.
pub fn dispatcher(config: SnapvisorConfig) -> snapvisor::Result<DispatcherContext> {
    let (ctx, events) = DispatcherContext::from_config(config)?;
    follow_progress(&events);
    Ok(ctx)
}

/// Request context for this process, acting for the invoking user.
pub fn cli_op(ctx: &DispatcherContext) -> OpContext {
    let op = OpContext::new(SessionId::new(format!("cli-{}", std::process::id())));
    ctx.collab.impersonator.bind(&op.session, invoking_uid());
    op
}

/// The user behind `sudo`, else the real uid.
fn invoking_uid() -> u32 {
    std::env::var("SUDO_UID")
        .ok()
        .and_then(|uid| uid.parse().ok())
        .unwrap_or_else(|| unsafe { libc::getuid() })
}

/// Print a value as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> snapvisor::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| snapvisor::Error::Config(format!("serialize output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

/// Echo progress and warnings from the event channel until it closes.
fn follow_progress(events: &BroadcastChannel) {
    let mut rx = events.subscribe();
    std::thread::spawn(move || loop {
        match rx.blocking_recv() {
            Ok(event) => match event.kind {
                EventKind::Progress { operation, percent } => {
                    eprint!("\r{}: {:>3}%", operation, percent);
                    if percent >= 100 {
                        eprintln!();
                    }
                    let _ = std::io::stderr().flush();
                }
                EventKind::Warning { message } => eprintln!("warning: {}", message),
                EventKind::Question { question } => {
                    eprintln!("{:?}: answering no (pass --force to proceed)", question)
                }
                _ => {}
            },
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    });
}
