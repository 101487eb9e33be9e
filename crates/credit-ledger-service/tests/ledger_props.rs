//! Property tests for ledger writes against the in-memory store.

use std::sync::Arc;

use credit_ledger_core::{
    CreditError, Direction, TransactionId, TransactionStatus, TransactionType, UserId,
};
use credit_ledger_service::{ApplyOptions, Ledger};
use credit_ledger_store::{MemoryStore, Store};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Settle {
    Complete,
    Fail,
    Leave,
}

#[derive(Debug, Clone)]
enum Op {
    Grant(u64),
    Use(u64),
    Hold(u64),
    ReleaseHold { complete: bool },
    Purchase(u64, Settle),
    Expire(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..100).prop_map(Op::Grant),
        (1u64..60).prop_map(Op::Use),
        (1u64..40).prop_map(Op::Hold),
        any::<bool>().prop_map(|complete| Op::ReleaseHold { complete }),
        (
            1u64..100,
            prop_oneof![
                Just(Settle::Complete),
                Just(Settle::Fail),
                Just(Settle::Leave)
            ]
        )
            .prop_map(|(c, s)| Op::Purchase(c, s)),
        (1u64..30).prop_map(Op::Expire),
    ]
}

fn hold_options() -> ApplyOptions {
    ApplyOptions {
        await_confirmation: Some(true),
        ..ApplyOptions::default()
    }
}

async fn run(ledger: &Ledger, user_id: UserId, op: Op, holds: &mut Vec<TransactionId>) {
    match op {
        Op::Grant(credits) => {
            ledger
                .apply_transaction(user_id, TransactionType::Bonus, credits, ApplyOptions::default())
                .await
                .unwrap();
        }
        Op::Use(credits) => {
            match ledger
                .apply_transaction(user_id, TransactionType::Usage, credits, ApplyOptions::default())
                .await
            {
                Ok(_) | Err(CreditError::InsufficientBalance { .. }) => {}
                Err(e) => panic!("unexpected usage error: {e}"),
            }
        }
        Op::Hold(credits) => {
            if let Ok(tx) = ledger
                .apply_transaction(user_id, TransactionType::Usage, credits, hold_options())
                .await
            {
                holds.push(tx.id);
            }
        }
        Op::ReleaseHold { complete } => {
            if let Some(id) = holds.pop() {
                if complete {
                    ledger.complete_transaction(id).await.unwrap();
                } else {
                    ledger.cancel_transaction(id, None).await.unwrap();
                }
            }
        }
        Op::Purchase(credits, settle) => {
            let tx = ledger
                .apply_transaction(user_id, TransactionType::Purchase, credits, ApplyOptions::default())
                .await
                .unwrap();
            match settle {
                Settle::Complete => {
                    ledger.complete_transaction(tx.id).await.unwrap();
                }
                Settle::Fail => {
                    ledger.fail_transaction(tx.id, "declined").await.unwrap();
                }
                Settle::Leave => {}
            }
        }
        Op::Expire(credits) => {
            let _ = ledger.expire_credits(user_id, credits, "expired").await;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the sequence, the stored balance equals the signed sum of
    /// completed transactions and the reservation equals the pending debits.
    #[test]
    fn stored_balance_matches_transaction_log(ops in prop::collection::vec(arb_op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(Arc::clone(&store), 3);
        let user_id = UserId::generate();
        let mut holds = Vec::new();

        for op in ops {
            runtime.block_on(run(&ledger, user_id, op, &mut holds));

            let balance = ledger.get_balance(&user_id).unwrap();
            let log = ledger.list_transactions(&user_id, 1_000, 0).unwrap();
            let settled: i128 = log.iter().map(|tx| tx.settled_delta()).sum();
            let reserved: u64 = log
                .iter()
                .filter(|tx| tx.status == TransactionStatus::Pending && tx.direction == Direction::Debit)
                .map(|tx| tx.credits)
                .sum();

            prop_assert!(balance.is_consistent());
            prop_assert_eq!(i128::from(balance.current_balance), settled);
            prop_assert_eq!(balance.reserved_credits, reserved);
        }
    }
}
