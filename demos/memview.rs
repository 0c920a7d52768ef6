//! Walkthrough of the memory diagnostics views: registers a handful of
//! allocations for the current process, then browses the listing, the
//! sparse bindings and a per-entry page dump.
//!
//! Run with `cargo run --example memview`.

use gmd_rs::diag::DiagCore;
use gmd_rs::mem::flags::MemFlags;
use gmd_rs::mem::{CacheMode, EntryDescriptor, PAGE_SIZE, PageMapper, UserMemType};
use gmd_rs::sys::proc::current_identity;
use gmd_rs::sys::RamPagePool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> gmd_rs::GmdResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("============================================================");
    println!("            GPU Memory Diagnostics - Browser Demo           ");
    println!("============================================================");

    let me = current_identity();
    println!("[+] Running as pid {} (uid {})", me.pid, me.uid);

    // 1. Build the diagnostics core with a RAM-backed page pool.
    let pool = Arc::new(RamPagePool::new(16)?);
    let core = Arc::new(
        DiagCore::builder()
            .mapper(Arc::clone(&pool) as Arc<dyn PageMapper>)
            .build(),
    );

    // 2. Register the current process and a few allocations.
    println!("[+] Registering process {}...", me.pid);
    let record = core.open_process(me.pid);

    let mut pages = Vec::new();
    for i in 0..3u8 {
        let page = pool.alloc_page()?;
        let fill: Vec<u8> = (0..PAGE_SIZE).map(|n| i.wrapping_add(n as u8)).collect();
        pool.write(page, 0, &fill);
        pages.push(Some(page));
    }
    // Leave a hole in the middle.
    pages[1] = None;

    let plain = core.register_entry(
        &record,
        EntryDescriptor::new(0x5000_0000, (3 * PAGE_SIZE) as u64)
            .cache(CacheMode::WriteBack)
            .usage(6) // texture
            .metadata("demo-texture")
            .pages(pages),
    );
    core.register_entry(
        &record,
        EntryDescriptor::new(0x5010_0000, 4096)
            .mem_type(UserMemType::DmaBuf)
            .usage(8),
    );
    let sparse = core.register_entry(
        &record,
        EntryDescriptor::new(0x6000_0000, 0x10000).flags(MemFlags::SPARSE_VIRT),
    );
    sparse.bind(0x0000, 0x2000, 0x4000);
    sparse.bind(0x4000, 0x1000, 0x9000);

    // 3. Browse the tree.
    println!("\n[+] Diagnostics tree under proc/{}:", me.pid);
    for name in core.fs().list(&format!("proc/{}", me.pid))? {
        println!("    {name}");
    }

    println!("\n------------------------------------------------------------");
    println!(" proc/{}/mem", me.pid);
    println!("------------------------------------------------------------");
    print!("{}", core.read_to_string(&format!("proc/{}/mem", me.pid), &me)?);

    println!("\n------------------------------------------------------------");
    println!(" proc/{}/sparse_mem", me.pid);
    println!("------------------------------------------------------------");
    print!(
        "{}",
        core.read_to_string(&format!("proc/{}/sparse_mem", me.pid), &me)?
    );

    println!("\n------------------------------------------------------------");
    println!(" proc/{}/{} (first lines of the page dump)", me.pid, plain.id());
    println!("------------------------------------------------------------");
    let dump = core.read_to_string(&format!("proc/{}/{}", me.pid, plain.id()), &me)?;
    for line in dump.lines().take(6) {
        println!("{line}");
    }
    println!(
        "    ... {} lines total (page 1 is a hole and emits nothing)",
        dump.lines().count()
    );

    // 4. Tear down.
    core.close_process(me.pid)?;
    core.shutdown();
    println!("\n[+] Done.");
    Ok(())
}
