mod common;

use common::{Harness, default_product, product};
use groupbuy_engine::domain::participant::ParticipantStatus;
use groupbuy_engine::domain::ports::SessionStore;
use groupbuy_engine::domain::session::SessionStatus;
use rust_decimal_macros::dec;

async fn fill_three(h: &Harness) -> groupbuy_engine::domain::session::SessionId {
    for user in 1..=3 {
        h.fund(user, dec!(10.0)).await;
    }
    h.clock.set(1_000);
    let (session, _) = h.manager.create_session(1, 1).await.unwrap();
    h.clock.set(2_000);
    h.manager.join_session(2, &session.code).await.unwrap();
    h.clock.set(3_000);
    h.manager.join_session(3, &session.code).await.unwrap();
    session.id
}

#[tokio::test]
async fn test_resettlement_moves_no_money() {
    let h = Harness::new(vec![default_product()]);
    let session_id = fill_three(&h).await;

    // 3 debits + 2 refunds.
    assert_eq!(h.wallet.operation_count().await, 5);
    let notifications = h.notifier.sent().await.len();

    let state = h.manager.session_state(session_id).await.unwrap();
    let record = state.result.unwrap();
    h.settlement
        .settle_success(&state.session, &record)
        .await
        .unwrap();

    assert_eq!(h.wallet.operation_count().await, 5);
    assert_eq!(h.notifier.sent().await.len(), notifications);
    assert_eq!(h.balance(2).await, dec!(10.0));
    assert_eq!(h.balance(3).await, dec!(10.0));
}

#[tokio::test]
async fn test_failed_refunds_escalate_then_recover() {
    let (h, flaky) = Harness::with_flaky_wallet(vec![default_product()]);
    flaky.fail_credits(true);

    let session_id = fill_three(&h).await;

    // Refund credits failed all attempts: losers stay Lost and unpaid,
    // each failure lands on the escalation queue.
    assert_eq!(h.escalations.len().await, 2);
    let participants = h.store.participants(session_id).await.unwrap();
    let lost: Vec<_> = participants
        .iter()
        .filter(|p| p.status == ParticipantStatus::Lost)
        .collect();
    assert_eq!(lost.len(), 2);
    assert_eq!(h.balance(2).await, dec!(0.0));

    // Ledger back up: re-settlement pays exactly the outstanding refunds.
    flaky.fail_credits(false);
    let state = h.manager.session_state(session_id).await.unwrap();
    let record = state.result.unwrap();
    h.settlement
        .settle_success(&state.session, &record)
        .await
        .unwrap();

    let participants = h.store.participants(session_id).await.unwrap();
    assert!(
        participants
            .iter()
            .filter(|p| p.position != record.winning_position)
            .all(|p| p.status == ParticipantStatus::Refunded)
    );
    assert_eq!(h.balance(2).await, dec!(10.0));
    assert_eq!(h.balance(3).await, dec!(10.0));
}

#[tokio::test]
async fn test_timeout_settlement_is_idempotent() {
    let h = Harness::new(vec![product(1, dec!(10.0), 5, 60_000)]);
    for user in 1..=3 {
        h.fund(user, dec!(10.0)).await;
    }
    h.clock.set(1_000);
    let (session, _) = h.manager.create_session(1, 1).await.unwrap();
    h.manager.join_session(2, &session.code).await.unwrap();
    h.manager.join_session(3, &session.code).await.unwrap();

    h.clock.set(61_000);
    assert_eq!(h.sweeper.sweep_once().await.unwrap(), 1);

    // 3 debits + 3 refunds.
    assert_eq!(h.wallet.operation_count().await, 6);
    for user in 1..=3 {
        assert_eq!(h.balance(user).await, dec!(10.0));
    }

    let state = h.store.get(session.id).await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Timeout);
    h.settlement.settle_timeout(&state).await.unwrap();
    assert_eq!(h.wallet.operation_count().await, 6);

    let sent = h.notifier.sent().await;
    for user in 1..=3 {
        assert_eq!(
            sent.iter()
                .filter(|(u, t)| *u == user && t == "group_buy_timeout")
                .count(),
            1
        );
    }
}

#[tokio::test]
async fn test_winner_keeps_payment_and_gets_unique_code() {
    let h = Harness::new(vec![default_product()]);
    let first = fill_three(&h).await;

    for user in 4..=6 {
        h.fund(user, dec!(10.0)).await;
    }
    h.clock.set(10_000);
    let (session, _) = h.manager.create_session(4, 1).await.unwrap();
    h.clock.set(11_000);
    h.manager.join_session(5, &session.code).await.unwrap();
    h.clock.set(12_000);
    h.manager.join_session(6, &session.code).await.unwrap();

    let code_of = |participants: &[groupbuy_engine::domain::participant::Participant]| {
        participants
            .iter()
            .find(|p| p.status == ParticipantStatus::Won)
            .and_then(|p| p.pickup_code.clone())
            .unwrap()
    };
    let first_code = code_of(&h.store.participants(first).await.unwrap());
    let second_code = code_of(&h.store.participants(session.id).await.unwrap());
    assert_ne!(first_code, second_code);
}
