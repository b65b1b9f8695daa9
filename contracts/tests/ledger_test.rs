//! Integration tests for the confidential ledger, driven through the runtime.
//!
//! Balances are read back through the test decrypt oracle; the contracts
//! themselves never see them.

mod common;

use chrono::Duration;
use cloak_contracts::events::Event;
use cloak_contracts::ledger::LedgerError;
use cloak_contracts::runtime::ResolutionOutcome;
use cloak_contracts::{
    Acceptance, ConfidentialReceiver, ExecutionContext, ReceiverError, RuntimeError,
    TransferNotice,
};
use cloak_protocol::Address;
use common::{addr, harness};
use cloak_protocol::EncryptedU64;
use parking_lot::Mutex;
use std::sync::Arc;

/// A receiver with a fixed verdict.
struct Fixed {
    address: Address,
    verdict: Result<Acceptance, &'static str>,
}

impl ConfidentialReceiver for Fixed {
    fn address(&self) -> Address {
        self.address
    }

    fn on_confidential_transfer_received(
        &mut self,
        _ctx: &mut ExecutionContext<'_>,
        _caller: Address,
        _notice: &TransferNotice,
    ) -> Result<Acceptance, ReceiverError> {
        self.verdict
            .map_err(|reason| ReceiverError::Rejected(reason.to_string()))
    }
}

/// Works in the store during the hook, remembers what it saw, then rejects.
struct Grabby {
    address: Address,
    accomplice: Address,
    seen: Arc<Mutex<Option<(EncryptedU64, EncryptedU64)>>>,
}

impl ConfidentialReceiver for Grabby {
    fn address(&self) -> Address {
        self.address
    }

    fn on_confidential_transfer_received(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        _caller: Address,
        notice: &TransferNotice,
    ) -> Result<Acceptance, ReceiverError> {
        let scratch = ctx
            .store
            .encrypt(7)
            .map_err(|e| ReceiverError::Rejected(e.to_string()))?;
        ctx.store
            .allow(notice.amount, self.accomplice)
            .map_err(|e| ReceiverError::Rejected(e.to_string()))?;
        *self.seen.lock() = Some((notice.amount, scratch));
        Ok(Acceptance::Reject)
    }
}

// ---------------------------------------------------------------------------
// Conservation
// ---------------------------------------------------------------------------

#[test]
fn balances_sum_to_wraps_minus_unwraps() {
    let h = harness(&[("alice", 5_000), ("bob", 2_000)]);
    h.wrap("alice", 1_000);
    h.wrap("bob", 500);
    assert_eq!(h.sum_of_balances(), 1_500);
    assert_eq!(h.supply(), 1_500);

    let amount = h.input("alice", 300);
    h.rt.transfer(h.ledger, addr("alice"), addr("bob"), amount, vec![])
        .unwrap();
    // Bob is short: carol receives an encrypted zero, nothing fails.
    let too_much = h.input("bob", 10_000);
    let moved = h
        .rt
        .transfer(h.ledger, addr("bob"), addr("carol"), too_much, vec![])
        .unwrap();
    assert_eq!(h.decrypt(moved), 0);
    assert_eq!(h.balance("carol"), Some(0));
    assert_eq!(h.balance("alice"), Some(700));
    assert_eq!(h.balance("bob"), Some(800));

    let burn = h.input("alice", 200);
    let id = h
        .rt
        .request_unwrap(h.ledger, addr("alice"), addr("alice"), addr("alice"), burn)
        .unwrap();
    // The burn is tentative but already off the books.
    assert_eq!(h.sum_of_balances(), 1_300);
    assert_eq!(h.supply(), 1_300);

    let report = h.rt.resolve(h.answer(id)).unwrap();
    assert_eq!(
        report.outcome,
        ResolutionOutcome::UnwrapClaimable {
            recipient: addr("alice"),
            amount: 200
        }
    );
    assert_eq!(h.rt.claim_unwrap(h.ledger, addr("alice"), &id).unwrap(), 200);
    assert_eq!(h.base("alice"), 4_200);
    assert_eq!(h.rt.base_balance(h.ledger, &h.ledger).unwrap(), 1_300);
    assert_eq!(h.sum_of_balances(), h.supply());
}

#[test]
fn wrap_without_backing_fails_cleanly() {
    let h = harness(&[("alice", 10)]);
    let err = h
        .rt
        .wrap(h.ledger, addr("alice"), addr("alice"), 11)
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Ledger(LedgerError::InsufficientFunds {
            required: 11,
            available: 10,
            ..
        })
    ));
    assert_eq!(h.balance("alice"), None);
    assert!(h.rt.events(0, 100).is_empty());
}

#[test]
fn claim_is_refused_before_resolution_and_after_claim() {
    let h = harness(&[("alice", 1_000)]);
    h.wrap("alice", 1_000);
    let amount = h.input("alice", 100);
    let id = h
        .rt
        .request_unwrap(h.ledger, addr("alice"), addr("alice"), addr("bob"), amount)
        .unwrap();

    let unresolved = h.rt.claim_unwrap(h.ledger, addr("bob"), &id);
    assert!(matches!(
        unresolved,
        Err(RuntimeError::Ledger(LedgerError::UnauthorizedOrUnresolved(_)))
    ));

    h.rt.resolve(h.answer(id)).unwrap();
    let wrong_caller = h.rt.claim_unwrap(h.ledger, addr("alice"), &id);
    assert!(matches!(
        wrong_caller,
        Err(RuntimeError::Ledger(LedgerError::UnauthorizedOrUnresolved(_)))
    ));
    assert_eq!(h.rt.claim_unwrap(h.ledger, addr("bob"), &id).unwrap(), 100);
    assert_eq!(h.base("bob"), 100);
    assert!(h.rt.claim_unwrap(h.ledger, addr("bob"), &id).is_err());
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

#[test]
fn operator_transfer_succeeds_only_before_expiry() {
    let h = harness(&[("alice", 1_000)]);
    h.wrap("alice", 1_000);
    let expiry = h.rt.now() + Duration::seconds(100);
    h.rt.authorize_operator(h.ledger, addr("alice"), addr("spender"), expiry)
        .unwrap();

    let amount = h.input("spender", 10);
    h.advance(99);
    assert!(h.rt.is_operator(h.ledger, &addr("alice"), &addr("spender")).unwrap());
    h.rt.transfer_from(
        h.ledger,
        addr("spender"),
        addr("alice"),
        addr("bob"),
        amount,
        vec![],
    )
    .unwrap();
    assert_eq!(h.balance("bob"), Some(10));

    h.advance(1);
    assert!(!h.rt.is_operator(h.ledger, &addr("alice"), &addr("spender")).unwrap());
    let err = h
        .rt
        .transfer_from(
            h.ledger,
            addr("spender"),
            addr("alice"),
            addr("bob"),
            amount,
            vec![],
        )
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Ledger(LedgerError::NotAuthorized { .. })));

    // The raw record survives its own expiry.
    let grant = h
        .rt
        .operator_grant(h.ledger, &addr("alice"), &addr("spender"))
        .unwrap()
        .unwrap();
    assert_eq!(grant.expiry, expiry);
}

#[test]
fn regrant_keeps_only_the_latest_expiry() {
    let h = harness(&[]);
    let now = h.rt.now();
    h.rt.authorize_operator(h.ledger, addr("alice"), addr("spender"), now + Duration::hours(1))
        .unwrap();
    h.rt.authorize_operator(h.ledger, addr("alice"), addr("spender"), now + Duration::seconds(60))
        .unwrap();

    let grant = h
        .rt
        .operator_grant(h.ledger, &addr("alice"), &addr("spender"))
        .unwrap()
        .unwrap();
    assert_eq!(grant.expiry, now + Duration::seconds(60));

    h.advance(60);
    assert!(!h.rt.is_operator(h.ledger, &addr("alice"), &addr("spender")).unwrap());
}

#[test]
fn expiry_in_the_past_or_present_is_rejected() {
    let h = harness(&[]);
    let err = h
        .rt
        .authorize_operator(h.ledger, addr("alice"), addr("spender"), h.rt.now())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Ledger(LedgerError::InvalidExpiry { .. })));
    assert!(h
        .rt
        .operator_grant(h.ledger, &addr("alice"), &addr("spender"))
        .unwrap()
        .is_none());
}

#[test]
fn revoked_operator_cannot_spend() {
    let h = harness(&[("alice", 100)]);
    h.wrap("alice", 100);
    let expiry = h.rt.now() + Duration::hours(1);
    h.rt.authorize_operator(h.ledger, addr("alice"), addr("spender"), expiry)
        .unwrap();
    assert!(h
        .rt
        .revoke_operator(h.ledger, addr("alice"), addr("spender"))
        .unwrap()
        .is_some());
    assert!(h
        .rt
        .revoke_operator(h.ledger, addr("alice"), addr("spender"))
        .unwrap()
        .is_none());

    let amount = h.input("spender", 1);
    assert!(h
        .rt
        .transfer_from(h.ledger, addr("spender"), addr("alice"), addr("spender"), amount, vec![])
        .is_err());
}

// ---------------------------------------------------------------------------
// Transfer hooks
// ---------------------------------------------------------------------------

#[test]
fn rejecting_hook_leaves_balances_and_events_untouched() {
    let h = harness(&[("alice", 1_000)]);
    h.wrap("alice", 1_000);
    let picky = addr("picky");
    h.rt.register_receiver(Box::new(Fixed {
        address: picky,
        verdict: Ok(Acceptance::Reject),
    }))
    .unwrap();

    let events_before = h.rt.events(0, 1_000).len();
    let amount = h.input("alice", 250);
    let err = h
        .rt
        .transfer(h.ledger, addr("alice"), picky, amount, b"hello".to_vec())
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Ledger(LedgerError::TransferRejected { receiver }) if receiver == picky
    ));
    assert_eq!(h.balance("alice"), Some(1_000));
    assert_eq!(h.rt.balance_of(h.ledger, &picky).unwrap(), None);
    assert_eq!(h.rt.events(0, 1_000).len(), events_before);
}

#[test]
fn rejecting_hook_keeps_no_access_to_the_moved_amount() {
    let h = harness(&[("alice", 1_000)]);
    h.wrap("alice", 1_000);
    let grabby = addr("grabby");
    let accomplice = addr("accomplice");
    let seen = Arc::new(Mutex::new(None));
    h.rt.register_receiver(Box::new(Grabby {
        address: grabby,
        accomplice,
        seen: seen.clone(),
    }))
    .unwrap();

    let amount = h.input("alice", 250);
    let records_before = h.rt.with_store(|store| store.len());
    let err = h
        .rt
        .transfer(h.ledger, addr("alice"), grabby, amount, vec![])
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Ledger(LedgerError::TransferRejected { receiver }) if receiver == grabby
    ));

    let seen = *seen.lock();
    let (moved, scratch) = seen.expect("hook ran");
    assert!(!h.rt.is_allowed(moved.handle(), &grabby));
    assert!(!h.rt.is_allowed(moved.handle(), &accomplice));
    assert!(!h.rt.with_store(|store| store.contains(&moved.handle())));
    assert!(!h.rt.with_store(|store| store.contains(&scratch.handle())));
    assert_eq!(h.rt.with_store(|store| store.len()), records_before);
    assert_eq!(h.balance("alice"), Some(1_000));
}

#[test]
fn failing_hook_rolls_back_like_a_rejection() {
    let h = harness(&[("alice", 1_000)]);
    h.wrap("alice", 1_000);
    let broken = addr("broken");
    h.rt.register_receiver(Box::new(Fixed {
        address: broken,
        verdict: Err("out of order"),
    }))
    .unwrap();
    let amount = h.input("alice", 1);
    h.rt.transfer(h.ledger, addr("alice"), addr("bob"), amount, vec![])
        .unwrap();

    let events_before = h.rt.events(0, 1_000).len();
    let err = h
        .rt
        .transfer(h.ledger, addr("alice"), broken, amount, vec![])
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Ledger(LedgerError::Receiver(ReceiverError::Rejected(_)))
    ));
    assert_eq!(h.balance("alice"), Some(999));
    assert_eq!(h.balance("bob"), Some(1));
    assert_eq!(h.rt.events(0, 1_000).len(), events_before);
}

#[test]
fn accepting_hook_sees_the_moved_amount() {
    let h = harness(&[("alice", 1_000)]);
    h.wrap("alice", 1_000);
    let happy = addr("happy");
    h.rt.register_receiver(Box::new(Fixed {
        address: happy,
        verdict: Ok(Acceptance::Accept),
    }))
    .unwrap();
    let amount = h.input("alice", 400);
    h.rt.transfer(h.ledger, addr("alice"), happy, amount, vec![])
        .unwrap();
    assert_eq!(h.balance("happy"), Some(400));
}

#[test]
fn oversized_callback_data_is_refused() {
    let h = harness(&[("alice", 1_000)]);
    h.wrap("alice", 1_000);
    let amount = h.input("alice", 1);
    let err = h
        .rt
        .transfer(h.ledger, addr("alice"), addr("bob"), amount, vec![0; 4_097])
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Ledger(LedgerError::CallbackDataTooLarge { len: 4_097, .. })
    ));
}

// ---------------------------------------------------------------------------
// Disclosure & events
// ---------------------------------------------------------------------------

#[test]
fn disclosure_publishes_the_value() {
    let h = harness(&[("alice", 1_000)]);
    let minted = h.wrap("alice", 640);
    let id = h.rt.disclose(h.ledger, addr("alice"), minted).unwrap();
    let report = h.rt.resolve(h.answer(id)).unwrap();
    assert!(matches!(report.outcome, ResolutionOutcome::Disclosed { value: 640, .. }));

    let last = h.rt.events(0, 1_000).pop().unwrap();
    assert!(matches!(last.event, Event::AmountDisclosed { value: 640, .. }));

    // Bob has no access to alice's handle.
    assert!(h.rt.disclose(h.ledger, addr("bob"), minted).is_err());
}

#[test]
fn events_page_by_sequence() {
    let h = harness(&[("alice", 1_000)]);
    for _ in 0..4 {
        h.wrap("alice", 10);
    }
    let all = h.rt.events(0, 100);
    assert_eq!(all.len(), 4);
    let tail = h.rt.events(2, 100);
    assert_eq!(tail.first().map(|r| r.sequence), Some(3));
    assert!(all.iter().all(|r| matches!(r.event, Event::Wrapped { .. })));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_transfers_conserve_supply() {
    let h = Arc::new(harness(&[("alice", 10_000), ("bob", 10_000)]));
    h.wrap("alice", 10_000);
    h.wrap("bob", 10_000);

    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let h = h.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
            for _ in 0..5 {
                let amount = h.input(from, 100 + i);
                h.rt.transfer(h.ledger, addr(from), addr(to), amount, vec![])
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(h.sum_of_balances(), 20_000);
    assert_eq!(h.supply(), 20_000);
}
