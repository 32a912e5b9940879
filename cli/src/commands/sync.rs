use anyhow::{Result, bail};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use kcal_core::Store;
use kcal_core::models::{EntityKind, UserId};

use super::helpers::{parse_ack, print_json};

pub(crate) async fn cmd_sync_pending(store: &Store, owner: &UserId, json: bool) -> Result<()> {
    let counts = store.pending_counts(owner).await?;

    if json {
        print_json(&counts)?;
        return Ok(());
    }

    #[derive(Tabled)]
    struct PendingRow {
        #[tabled(rename = "Kind")]
        kind: String,
        #[tabled(rename = "Pending")]
        count: i64,
    }

    let total: i64 = counts.iter().map(|c| c.count).sum();
    if total == 0 {
        println!("Everything is synced.");
        return Ok(());
    }
    let rows: Vec<PendingRow> = counts
        .iter()
        .filter(|c| c.count > 0)
        .map(|c| PendingRow {
            kind: c.kind.to_string(),
            count: c.count,
        })
        .collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..2)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    println!("{total} row(s) waiting for upload");
    Ok(())
}

pub(crate) async fn cmd_sync_list(
    store: &Store,
    owner: &UserId,
    kind: &str,
    json: bool,
) -> Result<()> {
    let kind: EntityKind = kind.parse()?;
    let records = store.list_unsynced(kind, owner).await?;

    if json {
        print_json(&records)?;
    } else if records.is_empty() {
        println!("No unsynced {kind} rows.");
    } else {
        #[derive(Tabled)]
        struct RecordRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Action")]
            action: String,
            #[tabled(rename = "Last modified")]
            last_modified: String,
        }

        let rows: Vec<RecordRow> = records
            .iter()
            .map(|r| RecordRow {
                id: r.id.clone(),
                action: r
                    .envelope
                    .sync_action
                    .map_or("-".to_string(), |a| a.as_str().to_string()),
                last_modified: r.envelope.last_modified.to_rfc3339(),
            })
            .collect();
        let table = Table::new(&rows).with(Style::rounded()).to_string();
        println!("{table}");
    }
    Ok(())
}

pub(crate) async fn cmd_sync_mark(
    store: &Store,
    kind: &str,
    ids: &[String],
    json: bool,
) -> Result<()> {
    let kind: EntityKind = kind.parse()?;
    let acks = ids
        .iter()
        .map(|s| parse_ack(s))
        .collect::<Result<Vec<_>>>()?;
    let requested = acks.len();
    let marked = store.mark_synced(kind, acks).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "kind": kind, "requested": requested, "marked": marked })
        );
    } else {
        println!("Marked {marked} of {requested} {kind} row(s) as synced");
    }
    Ok(())
}

pub(crate) async fn cmd_sync_tombstones(
    store: &Store,
    owner: &UserId,
    ack: Vec<i64>,
    json: bool,
) -> Result<()> {
    if !ack.is_empty() {
        if ack.iter().any(|s| *s <= 0) {
            bail!("Tombstone sequence numbers are positive");
        }
        let removed = store.ack_tombstones(ack).await?;
        if json {
            println!("{}", serde_json::json!({ "acknowledged": removed }));
        } else {
            println!("Acknowledged {removed} deletion(s)");
        }
        return Ok(());
    }

    let tombstones = store.list_tombstones(owner).await?;
    if json {
        print_json(&tombstones)?;
    } else if tombstones.is_empty() {
        println!("No pending deletions.");
    } else {
        #[derive(Tabled)]
        struct TombstoneRow {
            #[tabled(rename = "Seq")]
            seq: i64,
            #[tabled(rename = "Kind")]
            kind: String,
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Deleted at")]
            deleted_at: String,
        }

        let rows: Vec<TombstoneRow> = tombstones
            .iter()
            .map(|t| TombstoneRow {
                seq: t.seq,
                kind: t.kind.to_string(),
                id: t.id.clone(),
                deleted_at: t.deleted_at.to_rfc3339(),
            })
            .collect();
        let table = Table::new(&rows).with(Style::rounded()).to_string();
        println!("{table}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kcal_core::models::NewWeightEntry;

    #[tokio::test]
    async fn test_mark_then_pending_is_empty() {
        let store = Store::open_in_memory().unwrap();
        let alice = UserId::new("alice").unwrap();
        let w = store
            .insert_weight(
                &alice,
                NewWeightEntry {
                    date: store.today(),
                    weight_kg: 70.0,
                    notes: None,
                },
            )
            .await
            .unwrap();

        cmd_sync_mark(&store, "weights", &[format!("{}:srv-7", w.id)], true)
            .await
            .unwrap();

        assert!(
            store
                .list_unsynced(EntityKind::Weight, &alice)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(store.get_weight(&alice, "srv-7").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let alice = UserId::new("alice").unwrap();
        assert!(cmd_sync_list(&store, &alice, "recipes", true).await.is_err());
    }
}
