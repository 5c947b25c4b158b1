//! Power-cut rehearsal for the defrag journal.
//!
//! Runs the same compaction over and over with the power failing one
//! flash operation later on each attempt:
//! 1. Seed a device and snapshot the pristine image
//! 2. Run one clean pass for the reference image
//! 3. For each budget N: restore, let the pass die during operation N+1
//! 4. Remount the way a reboot would (journal replay or spare cleanup)
//! 5. Verify the device converges on the reference image
//!
//! Run with RUST_LOG=debug to watch the journal phases.

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use tfs::{DeviceGeometry, FileFlags, FlashDevice, MediaKind, MemFlash, Tfs, TfsError, TfsResult};

/// Passes reads through, but dies partway into the (budget+1)-th
/// mutating operation: half the bytes of that write land, nothing after.
struct CutFlash {
    inner: Arc<MemFlash>,
    remaining: AtomicI32,
}

impl CutFlash {
    fn new(inner: Arc<MemFlash>, budget: i32) -> Arc<Self> {
        Arc::new(CutFlash {
            inner,
            remaining: AtomicI32::new(budget),
        })
    }
}

impl FlashDevice for CutFlash {
    fn read_at(&self, offset: u32, out: &mut [u8]) -> TfsResult<()> {
        self.inner.read_at(offset, out)
    }

    fn write_at(&self, offset: u32, data: &[u8]) -> TfsResult<()> {
        let left = self.remaining.fetch_sub(1, Ordering::SeqCst);
        if left < 0 {
            return Err(TfsError::FlashFail);
        }
        if left == 0 {
            self.inner.write_at(offset, &data[..data.len() / 2])?;
            return Err(TfsError::FlashFail);
        }
        self.inner.write_at(offset, data)
    }

    fn erase_sector(&self, index: usize) -> TfsResult<()> {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(TfsError::FlashFail);
        }
        self.inner.erase_sector(index)
    }

    fn geometry(&self) -> &DeviceGeometry {
        self.inner.geometry()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind()
    }
}

fn main() {
    env_logger::init();

    println!("TFS Power-Cut Rehearsal");
    println!("=======================\n");

    let mem = MemFlash::new(512, 4);
    {
        let tfs = Tfs::new();
        tfs.add_device("//FLASH/", mem.clone()).expect("register");
        tfs.add("boot", "", FileFlags::empty(), &[0x11; 300]).expect("add boot");
        tfs.add("junk", "", FileFlags::empty(), &[0x22; 500]).expect("add junk");
        tfs.add("conf", "", FileFlags::empty(), &[0x33; 80]).expect("add conf");
        tfs.unlink("junk").expect("unlink junk");
    }
    let pristine = mem.snapshot();
    println!("✓ Seeded: boot and conf live, junk deleted in place");

    let reference = {
        let tfs = Tfs::new();
        tfs.add_device("//FLASH/", mem.clone()).expect("register");
        tfs.defrag_device(0).expect("reference pass");
        mem.snapshot()
    };
    println!("✓ Reference pass complete, rehearsing cuts\n");

    let mut budget = 0;
    loop {
        assert!(budget < 100, "pass never completed");
        mem.restore(&pristine).expect("restore");

        let outcome = {
            let tfs = Tfs::new();
            tfs.add_device("//CUT/", CutFlash::new(mem.clone(), budget))
                .expect("register");
            tfs.defrag_device(0)
        };
        if let Ok(did) = outcome {
            assert!(did, "seeded device had nothing to reclaim");
            assert_eq!(mem.snapshot(), reference);
            println!("\n✓ Budget {} covers the whole pass; every cut converged", budget);
            break;
        }

        // power restored: mount replays the journal or clears the spare,
        // and a follow-up pass finishes whatever was left
        let tfs = Tfs::new();
        tfs.add_device("//FLASH/", mem.clone()).expect("register");
        tfs.mount_all().expect("mount");
        tfs.defrag_device(0).expect("follow-up pass");
        assert_eq!(mem.snapshot(), reference, "budget {} diverged", budget);
        let names: Vec<String> = tfs
            .list(0)
            .expect("list")
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        println!("  cut after {:>2} ops: recovered, live files {:?}", budget, names);
        budget += 1;
    }
}
