//! Walkthrough of the global toggles: the strict-allocation-retry
//! attribute and a device's lazily probed breakpoint toggle.
//!
//! Run with `cargo run --example toggles`.

use gmd_rs::diag::{DiagCore, Identity};
use gmd_rs::sys::proc::current_identity;
use gmd_rs::{DebugRegProbe, DebugRegs, Device};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// Pretends the platform exposes a debug register block.
struct DemoProbe;

impl DebugRegProbe for DemoProbe {
    fn acquire(&self) -> Option<DebugRegs> {
        println!("    (probe ran: acquiring debug register block)");
        Some(DebugRegs {
            base: 0xfd40_0000,
            len: 0x1000,
        })
    }
}

fn main() -> gmd_rs::GmdResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("============================================================");
    println!("            GPU Memory Diagnostics - Toggles Demo           ");
    println!("============================================================");

    let me = current_identity();
    let core = Arc::new(DiagCore::builder().build());

    // Writes need a privileged identity; reads do not.
    let admin = Identity::new(me.pid, 0);

    println!("\n[+] strict_memory starts off:");
    println!("    debug/strict_memory = {:?}", core.read_to_string("debug/strict_memory", &me)?);

    core.fs().write_attr("debug/strict_memory", &admin, 1)?;
    println!("[+] After a privileged write of 1:");
    println!("    debug/strict_memory = {:?}", core.read_to_string("debug/strict_memory", &me)?);
    println!("    core.strict_memory() = {}", core.strict_memory());

    if core.fs().write_attr("debug/strict_memory", &me, 0).is_err() && !me.is_root() {
        println!("[+] Unprivileged write correctly denied for uid {}", me.uid);
    }

    // Device breakpoint toggle with one-time probe.
    println!("\n[+] Registering device kgsl-3d0...");
    let device = Arc::new(Device::new("kgsl-3d0", Box::new(DemoProbe)));
    core.register_device(&device);

    let path = "kgsl-3d0/snapshot/break_debug";
    println!("    {path} = {:?}", core.read_to_string(path, &me)?);

    println!("[+] Enabling the breakpoint twice (the probe runs once):");
    core.fs().write_attr(path, &admin, 1)?;
    core.fs().write_attr(path, &admin, 0)?;
    core.fs().write_attr(path, &admin, 1)?;
    println!("    {path} = {:?}", core.read_to_string(path, &me)?);
    println!("    debug regs = {:?}", device.debug_regs());

    device.close();
    core.shutdown();
    println!("\n[+] Done.");
    Ok(())
}
