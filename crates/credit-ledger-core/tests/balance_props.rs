//! Property tests for the balance counters.

use chrono::Utc;
use credit_ledger_core::{
    AccountBalance, Direction, Transaction, TransactionStatus, TransactionType, UserId,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Grant(TransactionType, u64),
    Spend(TransactionType, u64),
    Hold(u64),
    Release(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (
            prop_oneof![
                Just(TransactionType::Purchase),
                Just(TransactionType::Bonus),
                Just(TransactionType::Trial),
                Just(TransactionType::Refund),
            ],
            1u64..200
        )
            .prop_map(|(t, c)| Op::Grant(t, c)),
        (
            prop_oneof![
                Just(TransactionType::Usage),
                Just(TransactionType::Expiry),
                Just(TransactionType::Refund),
            ],
            1u64..200
        )
            .prop_map(|(t, c)| Op::Spend(t, c)),
        (1u64..50).prop_map(Op::Hold),
        (1u64..50).prop_map(Op::Release),
    ]
}

fn completed(user_id: UserId, t: TransactionType, direction: Direction, credits: u64) -> Transaction {
    let mut tx = Transaction::pending(user_id, t, direction, credits, "prop", Utc::now()).unwrap();
    tx.transition(TransactionStatus::Completed, Utc::now()).unwrap();
    tx
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// The counter identity holds and the balance equals the signed sum of
    /// settled transactions, whatever mix of operations is applied.
    #[test]
    fn counters_match_settled_sum(ops in prop::collection::vec(arb_op(), 1..60)) {
        let user_id = UserId::generate();
        let mut balance = AccountBalance::empty(user_id, Utc::now());
        let mut settled: i128 = 0;
        let mut holds: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                Op::Grant(t, credits) => {
                    let tx = completed(user_id, t, Direction::Credit, credits);
                    balance.settle(&tx, Utc::now()).unwrap();
                    settled += tx.settled_delta();
                }
                Op::Spend(t, credits) => {
                    // Debits always reserve first; a failed reservation leaves
                    // nothing behind.
                    if balance.reserve(credits).is_ok() {
                        let tx = completed(user_id, t, Direction::Debit, credits);
                        balance.settle(&tx, Utc::now()).unwrap();
                        settled += tx.settled_delta();
                    }
                }
                Op::Hold(credits) => {
                    if balance.reserve(credits).is_ok() {
                        holds.push(credits);
                    }
                }
                Op::Release(_) => {
                    if let Some(credits) = holds.pop() {
                        balance.release(credits);
                    }
                }
            }

            prop_assert!(balance.is_consistent());
            prop_assert_eq!(i128::from(balance.current_balance), settled);
            prop_assert_eq!(balance.reserved_credits, holds.iter().sum::<u64>());
        }
    }
}
