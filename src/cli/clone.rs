//! Clone command.

use super::parsers::parse_external_disks;
use super::{cli_op, dispatcher, print_json};
use clap::Args;
use snapvisor::clone::{CloneEngine, CloneRequest, ExternalDisks};
use snapvisor::config::SnapvisorConfig;
use std::path::PathBuf;

/// Clone a VM
#[derive(Args, Debug)]
pub struct CloneCmd {
    /// Source VM name or uuid
    pub vm: String,

    /// Name of the new VM
    #[arg(short, long)]
    pub name: String,

    /// Directory to create the new VM in (default: the VM root)
    #[arg(long, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Share disk data with the source through a snapshot
    #[arg(long)]
    pub linked: bool,

    /// Register the new VM as a template
    #[arg(long)]
    pub template: bool,

    /// Regenerate the Windows SID on first boot
    #[arg(long)]
    pub change_sid: bool,

    /// Keep boot camp partitions attached
    #[arg(long)]
    pub import_bootcamp: bool,

    /// Disks outside the source home: link or detach
    #[arg(long, default_value = "link", value_parser = parse_external_disks)]
    pub external_disks: ExternalDisks,

    /// Proceed without asking when free space is low or unknown
    #[arg(short, long)]
    pub force: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl CloneCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let ctx = dispatcher(config)?;
        let source = ctx.locate(&self.vm)?;
        let request = CloneRequest {
            name: self.name,
            home_parent: self.home,
            linked: self.linked,
            template: self.template,
            change_sid: self.change_sid,
            import_bootcamp: self.import_bootcamp,
            external_disks: self.external_disks,
            force: self.force,
        };
        let outcome = CloneEngine::new(&ctx).clone_vm(&cli_op(&ctx), &source, &request)?;

        if self.json {
            return print_json(&outcome);
        }
        println!(
            "Cloned {} to {} ({}) at {}",
            self.vm,
            outcome.vm.name,
            outcome.vm.uuid,
            outcome.vm.home.display()
        );
        if let Some(guid) = outcome.source_snapshot {
            println!("Linked to source snapshot {}", guid);
        }
        Ok(())
    }
}
