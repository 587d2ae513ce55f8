//! VM catalogue commands.

use super::print_json;
use clap::{Args, Subcommand};
use snapvisor::catalogue::{CatalogueItem, VmCatalogue};
use snapvisor::config::SnapvisorConfig;
use snapvisor::vm::VmConfig;
use snapvisor::Error;
use std::path::PathBuf;

/// Manage the VM catalogue
#[derive(Subcommand, Debug)]
pub enum VmsCmd {
    /// List registered VMs
    #[command(alias = "ls")]
    List(VmsListCmd),
    /// Register an existing VM home
    Register(VmsRegisterCmd),
    /// Remove a VM from the catalogue, keeping its files
    Unregister(VmsUnregisterCmd),
}

impl VmsCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        match self {
            VmsCmd::List(cmd) => cmd.run(config),
            VmsCmd::Register(cmd) => cmd.run(config),
            VmsCmd::Unregister(cmd) => cmd.run(config),
        }
    }
}

/// List registered VMs
#[derive(Args, Debug)]
pub struct VmsListCmd {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl VmsListCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let vms = VmCatalogue::open(&config.catalogue_path)?.list();

        if self.json {
            return print_json(&vms);
        }
        if vms.is_empty() {
            println!("No VMs found");
            return Ok(());
        }
        println!("{:<20} {:<38} {:<9} {}", "NAME", "UUID", "TEMPLATE", "HOME");
        println!("{}", "-".repeat(90));
        for vm in vms {
            println!(
                "{:<20} {:<38} {:<9} {}",
                vm.name,
                vm.uuid,
                if vm.template { "yes" } else { "no" },
                vm.home.display()
            );
        }
        Ok(())
    }
}

/// Register an existing VM home
#[derive(Args, Debug)]
pub struct VmsRegisterCmd {
    /// VM home directory containing config.json
    #[arg(value_name = "HOME")]
    pub home: PathBuf,
}

impl VmsRegisterCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let home = std::fs::canonicalize(&self.home)?;
        let vm = VmConfig::load(&home)?;
        let catalogue = VmCatalogue::open(&config.catalogue_path)?;
        catalogue.register(CatalogueItem {
            uuid: vm.uuid.clone(),
            name: vm.name.clone(),
            home: home.clone(),
            template: vm.template,
        })?;
        tracing::info!(uuid = %vm.uuid, name = %vm.name, home = %home.display(), "vm registered");
        println!("Registered {} ({})", vm.name, vm.uuid);
        Ok(())
    }
}

/// Remove a VM from the catalogue, keeping its files
#[derive(Args, Debug)]
pub struct VmsUnregisterCmd {
    /// VM name or uuid
    pub vm: String,
}

impl VmsUnregisterCmd {
    pub fn run(self, config: SnapvisorConfig) -> snapvisor::Result<()> {
        let catalogue = VmCatalogue::open(&config.catalogue_path)?;
        let item = catalogue
            .find(&self.vm)
            .ok_or_else(|| Error::VmNotFound(self.vm.clone()))?;
        catalogue.remove(&item.uuid)?;
        tracing::info!(uuid = %item.uuid, name = %item.name, "vm unregistered");
        println!("Unregistered {} ({})", item.name, item.uuid);
        Ok(())
    }
}
