//! TFS walkthrough on a RAM-backed flash device.
//!
//! Builds a small in-memory device, exercises the public surface:
//! 1. Register and mount a device
//! 2. Add files, symlinks, and a boot script
//! 3. Read back through descriptors
//! 4. Unlink and reclaim the dead records with a defrag pass
//! 5. Print the integrity report and the final listing
//!
//! Run with `cargo run --example tfs_demo`; add `--json` for a
//! machine-readable listing and RUST_LOG=debug to watch the phases.

use clap::Parser;
use tfs::{FileFlags, FlashDevice, MemFlash, OpenMode, SeekFrom, Tfs};

#[derive(Parser)]
#[command(about = "TFS demo on an in-memory flash device")]
struct Args {
    /// Sector length in bytes
    #[arg(long, default_value_t = 4096)]
    sector_len: u32,

    /// Sector count, spare included
    #[arg(long, default_value_t = 8)]
    sectors: usize,

    /// Print the final listing as JSON
    #[arg(long)]
    json: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    println!("TFS Demo");
    println!("========\n");

    let dev = MemFlash::new(args.sector_len, args.sectors);
    let tfs = Tfs::new();
    tfs.add_device("//FLASH/", dev.clone()).expect("register device");
    tfs.mount_all().expect("mount");
    println!(
        "✓ Device ready: {} sectors of {} bytes, spare sector at {:#x}",
        args.sectors,
        args.sector_len,
        dev.geometry().spare().offset
    );

    println!("\n✓ Add some files");
    tfs.add("motd", "message of the day", FileFlags::empty(), b"welcome to the monitor\n")
        .expect("add motd");
    tfs.add(
        "monrc",
        "startup script",
        FileFlags::EXEC_SCRIPT | FileFlags::BOOT_RUN,
        b"echo booting\n",
    )
    .expect("add monrc");
    tfs.add("scratch", "", FileFlags::empty(), &[0x5a; 600])
        .expect("add scratch");
    tfs.link("greeting", "motd").expect("link greeting -> motd");
    for entry in tfs.list(0).expect("list") {
        println!(
            "  {:<10} {:>6} bytes  flags \"{}\"  at {:#06x}",
            entry.name, entry.size, entry.flag_text, entry.offset
        );
    }

    println!("\n✓ Read through a descriptor (symlink resolves to the target)");
    let fd = tfs
        .open("greeting", OpenMode::ReadOnly, FileFlags::empty())
        .expect("open greeting");
    let mut buf = [0u8; 64];
    let n = tfs.read(fd, &mut buf).expect("read");
    print!("  greeting: {}", String::from_utf8_lossy(&buf[..n]));
    tfs.close(fd, None).expect("close");

    println!("\n✓ Grow a file with the append mode");
    let fd = tfs
        .open("motd", OpenMode::Append, FileFlags::empty())
        .expect("open for append");
    println!("  position after open: {}", tfs.tell(fd).expect("tell"));
    tfs.write(fd, b"have a nice day\n").expect("write");
    tfs.close(fd, None).expect("close commits the new version");
    let fd = tfs
        .open("motd", OpenMode::ReadOnly, FileFlags::empty())
        .expect("reopen");
    tfs.seek(fd, SeekFrom::Start(0)).expect("seek");
    let n = tfs.read(fd, &mut buf).expect("read");
    print!("  motd now reads:\n{}", String::from_utf8_lossy(&buf[..n]));
    tfs.close(fd, None).expect("close");

    println!("\n✓ Boot candidates: {:?}", tfs.boot_candidates().expect("scan"));

    println!("\n✓ Delete and reclaim");
    tfs.unlink("scratch").expect("unlink");
    let before = tfs.check(0).expect("check");
    println!(
        "  before defrag: {} live, {} dead records, {} dead bytes",
        before.live,
        before.stale + before.deleted,
        before.bytes_dead
    );
    let did = tfs.defrag_device(0).expect("defrag");
    let after = tfs.check(0).expect("check");
    println!(
        "  after defrag (pass ran: {}): {} live, {} dead bytes",
        did, after.live, after.bytes_dead
    );
    println!("  report: {}", after.to_json());

    println!("\n✓ Final listing");
    let listing = tfs.list(0).expect("list");
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&listing).expect("render listing")
        );
    } else {
        for entry in &listing {
            println!(
                "  {:<10} {:>6} bytes  crc {:#010x}  at {:#06x}",
                entry.name, entry.size, entry.filcrc, entry.offset
            );
        }
    }

    println!("\nDemo complete");
}
