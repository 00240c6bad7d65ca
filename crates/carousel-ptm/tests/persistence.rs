//! Durability across close-and-remap, against a single-threaded reference
//! model.

use std::path::Path;

use carousel_ptm::{alloc, Ptm, PtmConfig, PtmError};

fn config(path: &Path) -> PtmConfig {
    PtmConfig::new(path)
        .region_size(4096 + 4 * 256 * 1024)
        .replicas(4)
}

#[test]
fn committed_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("survive.ptm");

    {
        let ptm = Ptm::open(config(&path)).unwrap();
        ptm.write(|tx| {
            let arr = tx.alloc::<u64>(64 * 8)?;
            for i in 0..64u64 {
                arr.word::<u64>(i).store(tx, i * i);
            }
            tx.set_root(0, arr);
            Ok(0)
        })
        .unwrap();
    }

    let ptm = Ptm::open(config(&path)).unwrap();
    ptm.read(|tx| {
        let arr = tx.root::<u64>(0);
        assert!(!arr.is_null());
        for i in 0..64u64 {
            assert_eq!(arr.word::<u64>(i).load(tx), i * i);
        }
        Ok(0)
    })
    .unwrap();
}

#[test]
fn commit_sequence_matches_reference_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reference.ptm");
    const CELLS: u64 = 32;

    let mut model = vec![0u64; CELLS as usize];
    {
        let ptm = Ptm::open(config(&path)).unwrap();
        ptm.write(|tx| {
            let arr = tx.alloc::<u64>(CELLS * 8)?;
            tx.set_root(0, arr);
            Ok(0)
        })
        .unwrap();

        // A deterministic little workload: each transaction touches a few
        // cells, some repeatedly (exercising coalescing), and the model
        // applies the same stores.
        for round in 0..100u64 {
            let a = round % CELLS;
            let b = (round * 7 + 3) % CELLS;
            ptm.write(move |tx| {
                let arr = tx.root::<u64>(0);
                arr.word::<u64>(a).store(tx, round);
                arr.word::<u64>(b).store(tx, round + 1);
                arr.word::<u64>(a).store(tx, round + 2);
                Ok(0)
            })
            .unwrap();
            model[a as usize] = round;
            model[b as usize] = round + 1;
            model[a as usize] = round + 2;
        }
    }

    // Remap: the state must equal the model applied in commit order.
    let ptm = Ptm::open(config(&path)).unwrap();
    let model2 = model.clone();
    ptm.read(move |tx| {
        let arr = tx.root::<u64>(0);
        for (i, &want) in model2.iter().enumerate() {
            assert_eq!(arr.word::<u64>(i as u64).load(tx), want, "cell {i}");
        }
        Ok(0)
    })
    .unwrap();
}

#[test]
fn aborted_transactions_leave_no_trace_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abort.ptm");

    {
        let ptm = Ptm::open(config(&path)).unwrap();
        ptm.write(|tx| {
            let p = tx.alloc::<u64>(8)?;
            p.word::<u64>(0).store(tx, 11);
            tx.set_root(0, p);
            Ok(0)
        })
        .unwrap();
        let err = ptm.write(|tx| {
            tx.root::<u64>(0).word::<u64>(0).store(tx, 99);
            Err(carousel_ptm::TxAbort::User(1))
        });
        assert!(matches!(err, Err(PtmError::Aborted(_))));
    }

    let ptm = Ptm::open(config(&path)).unwrap();
    let v = ptm
        .read(|tx| Ok(tx.root::<u64>(0).word::<u64>(0).load(tx)))
        .unwrap();
    assert_eq!(v, 11);
}

#[test]
fn geometry_mismatch_on_reopen_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("geometry.ptm");
    {
        let _ptm = Ptm::open(config(&path)).unwrap();
    }
    let other = PtmConfig::new(&path)
        .region_size(4096 + 4 * 256 * 1024)
        .replicas(2);
    let got = Ptm::open(other).err();
    assert!(
        matches!(got, Some(PtmError::ConfigMismatch { .. })),
        "expected ConfigMismatch, got {got:?}"
    );
}

#[test]
fn allocator_churn_is_stable_across_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("churn.ptm");
    let ptm = Ptm::open(config(&path)).unwrap();

    // Prime the size class, then measure.
    ptm.write(|tx| {
        let p = tx.alloc::<u64>(48)?;
        tx.free(p);
        Ok(0)
    })
    .unwrap();
    let watermark = ptm.read(|tx| Ok(alloc::used_bytes(tx))).unwrap();

    for _ in 0..100 {
        ptm.write(|tx| {
            let p = tx.alloc::<u64>(48)?;
            tx.free(p);
            Ok(0)
        })
        .unwrap();
    }
    let after = ptm.read(|tx| Ok(alloc::used_bytes(tx))).unwrap();
    assert_eq!(after, watermark, "free-list reuse must not grow the heap");
}
