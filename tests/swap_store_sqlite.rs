use anyhow::{Context as _, Result};

use ln_chain_swap::swap::store::{SqliteSwapStore, SwapStore};
use ln_chain_swap::swap::{Asset, SwapRecord, SwapState, SwapType};

fn sample_swap(swap_type: SwapType, created_at: u64) -> SwapRecord {
    let mut record = SwapRecord::new_sender(
        swap_type,
        "02local",
        "03peer",
        Asset::Liquid("ab".repeat(32)),
        "100x1x1",
        10_000,
    );
    record.created_at = created_at;
    record
}

#[test]
fn sqlite_store_put_get_update_list() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("swaps.sqlite3");

    let store = SqliteSwapStore::open(path.clone()).context("open sqlite store")?;
    assert_eq!(store.path(), path.as_path());

    let mut a = sample_swap(SwapType::SwapOut, 1);
    store.put(&a).context("put swap-a")?;

    let got = store
        .get(&a.id)
        .context("get swap-a")?
        .context("swap-a missing")?;
    assert_eq!(got, a);

    a.previous = Some(SwapState::Created);
    a.current = SwapState::AwaitAgreement;
    a.taker_pubkey_hash = Some("11".repeat(20));
    store.put(&a).context("update swap-a")?;
    let got = store
        .get(&a.id)
        .context("get swap-a after update")?
        .context("swap-a missing after update")?;
    assert_eq!(got.current, SwapState::AwaitAgreement);
    assert_eq!(got.taker_pubkey_hash, a.taker_pubkey_hash);

    let mut b = sample_swap(SwapType::SwapIn, 2);
    b.current = SwapState::ClaimedPreimage;
    b.claim_tx_id = Some("cd".repeat(32));
    store.put(&b).context("put swap-b")?;

    let swaps = store.list().context("list swaps")?;
    assert_eq!(swaps.len(), 2);
    assert_eq!(swaps[0].id, a.id);
    assert_eq!(swaps[1].id, b.id);

    let active = store.list_active().context("list active swaps")?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, a.id);

    let missing = sample_swap(SwapType::SwapIn, 3);
    assert!(store.get(&missing.id)?.is_none());

    Ok(())
}

#[test]
fn sqlite_store_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("nested").join("swaps.sqlite3");

    let record = sample_swap(SwapType::SwapIn, 7);
    {
        let store = SqliteSwapStore::open(path.clone()).context("open sqlite store")?;
        store.put(&record)?;
        store.set_meta("version", "3")?;
        store.set_meta("version", "4")?;
    }

    let store = SqliteSwapStore::open(path).context("reopen sqlite store")?;
    assert_eq!(store.get(&record.id)?, Some(record));
    assert_eq!(store.get_meta("version")?.as_deref(), Some("4"));
    assert_eq!(store.get_meta("missing")?, None);
    Ok(())
}
