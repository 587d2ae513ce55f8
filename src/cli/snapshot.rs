//! Snapshot commands.

use super::{cli_op, dispatcher, print_json};
use clap::{Args, Subcommand};
use snapvisor::config::SnapvisorConfig;
use snapvisor::snapshot::{
    CreateRequest, DeleteOptions, RevertOptions, SnapshotEngine, SnapshotInfo,
};

/// Manage VM snapshots
#[derive(Subcommand, Debug)]
pub enum SnapshotCmd {
    /// List the snapshot tree of a VM
    #[command(alias = "ls")]
    List(SnapshotListCmd),
    /// Take a snapshot
    Create(SnapshotCreateCmd),
    /// Delete a snapshot
    #[command(alias = "rm")]
    Delete(SnapshotDeleteCmd),
    /// Revert a VM to a snapshot
    Revert(SnapshotRevertCmd),
    /// Report disk operations interrupted by a crash
    Scan(SnapshotScanCmd),
    /// Finish disk operations interrupted by a crash
    CommitUnfinished(SnapshotCommitCmd),
}

impl SnapshotCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        match self {
            SnapshotCmd::List(cmd) => cmd.run(config),
            SnapshotCmd::Create(cmd) => cmd.run(config),
            SnapshotCmd::Delete(cmd) => cmd.run(config),
            SnapshotCmd::Revert(cmd) => cmd.run(config),
            SnapshotCmd::Scan(cmd) => cmd.run(config),
            SnapshotCmd::CommitUnfinished(cmd) => cmd.run(config),
        }
    }
}

fn print_tree(nodes: &[SnapshotInfo], depth: usize) {
    for node in nodes {
        let marker = if node.current { "*" } else { " " };
        println!(
            "{}{}{:<38} {:<20} {:<10} {}",
            marker,
            "  ".repeat(depth),
            node.guid,
            truncate(&node.name, 18),
            node.vm_state.as_xml(),
            node.created
        );
        print_tree(&node.children, depth + 1);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// List the snapshot tree of a VM
#[derive(Args, Debug)]
pub struct SnapshotListCmd {
    /// VM name or uuid
    pub vm: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl SnapshotListCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let ctx = dispatcher(config)?;
        let vm = ctx.locate(&self.vm)?;
        let snapshots = SnapshotEngine::new(&ctx).list(&vm)?;

        if self.json {
            return print_json(&snapshots);
        }
        if snapshots.is_empty() {
            println!("No snapshots found");
            return Ok(());
        }
        println!(
            " {:<38} {:<20} {:<10} {}",
            "GUID", "NAME", "STATE", "CREATED"
        );
        println!("{}", "-".repeat(90));
        print_tree(&snapshots, 0);
        Ok(())
    }
}

/// Take a snapshot
#[derive(Args, Debug)]
pub struct SnapshotCreateCmd {
    /// VM name or uuid
    pub vm: String,

    /// Snapshot name
    #[arg(short, long)]
    pub name: String,

    /// Snapshot description
    #[arg(short, long, default_value = "")]
    pub description: String,
}

impl SnapshotCreateCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let ctx = dispatcher(config)?;
        let vm = ctx.locate(&self.vm)?;
        let request = CreateRequest {
            name: self.name,
            description: self.description,
        };
        let data = SnapshotEngine::new(&ctx).create(&cli_op(&ctx), &vm, &request)?;
        println!("Created snapshot {} ({})", data.guid, data.name);
        Ok(())
    }
}

/// Delete a snapshot
#[derive(Args, Debug)]
pub struct SnapshotDeleteCmd {
    /// VM name or uuid
    pub vm: String,

    /// Snapshot guid
    pub guid: String,

    /// Also delete the snapshots between this one and the current one
    #[arg(long)]
    pub child: bool,

    /// Discard snapshot data instead of merging it into the parent
    #[arg(long)]
    pub no_merge: bool,
}

impl SnapshotDeleteCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let ctx = dispatcher(config)?;
        let vm = ctx.locate(&self.vm)?;
        let options = DeleteOptions {
            child: self.child,
            merge: !self.no_merge,
        };
        SnapshotEngine::new(&ctx).destroy(&cli_op(&ctx), &vm, &self.guid, options)?;
        println!("Deleted snapshot {}", self.guid);
        Ok(())
    }
}

/// Revert a VM to a snapshot
#[derive(Args, Debug)]
pub struct SnapshotRevertCmd {
    /// VM name or uuid
    pub vm: String,

    /// Snapshot guid
    pub guid: String,

    /// Leave the VM powered off even if the snapshot was running
    #[arg(long)]
    pub skip_resume: bool,
}

impl SnapshotRevertCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let ctx = dispatcher(config)?;
        let vm = ctx.locate(&self.vm)?;
        let options = RevertOptions {
            skip_resume: self.skip_resume,
        };
        let outcome = SnapshotEngine::new(&ctx).revert(&cli_op(&ctx), &vm, &self.guid, options)?;
        println!("Reverted to snapshot {}", self.guid);
        if outcome.vm_stopped {
            println!("VM was stopped to complete the revert");
        }
        Ok(())
    }
}

/// Report disk operations interrupted by a crash
#[derive(Args, Debug)]
pub struct SnapshotScanCmd {
    /// VM name or uuid
    pub vm: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl SnapshotScanCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let ctx = dispatcher(config)?;
        let vm = ctx.locate(&self.vm)?;
        let states = SnapshotEngine::new(&ctx).scan(&vm)?;

        if self.json {
            return print_json(&states);
        }
        println!("{:<6} {:<40} {:<14} {}", "INDEX", "DISK", "PENDING", "SNAPSHOT");
        println!("{}", "-".repeat(90));
        for state in states {
            let pending = match &state.error {
                Some(e) => format!("error: {}", e),
                None => format!("{:?}", state.op).to_lowercase(),
            };
            println!(
                "{:<6} {:<40} {:<14} {}",
                state.index,
                truncate(&state.path.display().to_string(), 38),
                pending,
                state.snapshot.as_deref().unwrap_or("-")
            );
        }
        Ok(())
    }
}

/// Finish disk operations interrupted by a crash
#[derive(Args, Debug)]
pub struct SnapshotCommitCmd {
    /// VM name or uuid
    pub vm: String,
}

impl SnapshotCommitCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let ctx = dispatcher(config)?;
        let vm = ctx.locate(&self.vm)?;
        let plan = SnapshotEngine::new(&ctx).commit_unfinished(&cli_op(&ctx), &vm)?;
        if plan.is_empty() {
            println!("Nothing to finish");
        } else {
            println!(
                "Finished {} disk operation(s), removed {} snapshot(s)",
                plan.devices.len(),
                plan.snapshots_to_remove.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("base", 18), "base");
        assert_eq!(truncate("a-very-long-snapshot-name", 10), "a-very-...");
    }
}
