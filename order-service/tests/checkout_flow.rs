mod common;

use common::*;
use order_service::AddOutcome;
use payment_service::{GatewayKind, NotificationOutcome};
use shared::store::Ledger;
use shared::{DomainError, EventType, OrderStatus, ReservationStatus};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn checkout_creates_pending_order_and_clears_cart() {
    let h = Harness::new().await;
    let nasi = h.product("Nasi Goreng", 10).await;
    let teh = h.product("Es Teh", 10).await;

    h.carts.add_item(h.tenant, "guest-1", nasi, 2).await.unwrap();
    h.carts.add_item(h.tenant, "guest-1", teh, 1).await.unwrap();

    let receipt = h
        .checkout
        .checkout(h.tenant, "guest-1", &pickup("Dewi"))
        .await
        .unwrap();

    assert_eq!(receipt.total, 3 * UNIT_PRICE);
    assert!(receipt.payment_redirect_url.is_some());
    assert!(shared::reference::is_well_formed(&receipt.order_reference));

    let details = h.details(&receipt.order_reference).await;
    assert_eq!(details.order.status, OrderStatus::Pending);
    assert_eq!(details.items.len(), 2);
    assert_eq!(details.reservations.len(), 2);
    assert!(details
        .reservations
        .iter()
        .all(|r| r.status == ReservationStatus::Active));
    assert_eq!(
        receipt.reservation_expires_at,
        details.reservations[0].expires_at
    );

    let cart = h.carts.get_cart(h.tenant, "guest-1").await.unwrap();
    assert!(cart.is_empty());

    let events = h.ledger.outbox_events().await;
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::OrderCreated.as_str()));
}

#[tokio::test]
async fn empty_cart_cannot_check_out() {
    let h = Harness::new().await;

    let err = h
        .checkout
        .checkout(h.tenant, "nobody", &pickup("Dewi"))
        .await
        .unwrap_err();

    assert!(matches!(err, DomainError::EmptyCart));
    assert_eq!(h.ledger.order_count().await, 0);
}

#[tokio::test]
async fn second_guest_sees_stock_held_by_the_first() {
    let h = Harness::new().await;
    let rendang = h.product("Rendang", 5).await;

    h.carts.add_item(h.tenant, "guest-a", rendang, 5).await.unwrap();
    h.checkout
        .checkout(h.tenant, "guest-a", &pickup("Ayu"))
        .await
        .unwrap();

    let err = h
        .carts
        .add_item(h.tenant, "guest-b", rendang, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::OutOfStock { available: 0, .. }));
}

#[tokio::test]
async fn cart_add_is_clamped_to_availability() {
    let h = Harness::new().await;
    let sate = h.product("Sate Ayam", 3).await;

    let (cart, outcome) = h.carts.add_item(h.tenant, "guest", sate, 5).await.unwrap();

    assert_eq!(
        outcome,
        AddOutcome::Adjusted {
            requested: 5,
            applied: 3
        }
    );
    assert_eq!(cart.quantity_of(sate), 3);
}

#[tokio::test]
async fn stale_cart_is_rejected_with_shortfalls() {
    let h = Harness::new().await;
    let soto = h.product("Soto", 2).await;

    // Both guests fill their carts before either checks out.
    h.carts.add_item(h.tenant, "first", soto, 2).await.unwrap();
    h.carts.add_item(h.tenant, "second", soto, 2).await.unwrap();

    h.checkout
        .checkout(h.tenant, "first", &pickup("Budi"))
        .await
        .unwrap();
    let err = h
        .checkout
        .checkout(h.tenant, "second", &pickup("Sari"))
        .await
        .unwrap_err();

    match err {
        DomainError::InsufficientInventory(shortfalls) => {
            assert_eq!(shortfalls.len(), 1);
            assert_eq!(shortfalls[0].product_id, soto);
            assert_eq!(shortfalls[0].requested, 2);
            assert_eq!(shortfalls[0].available, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.ledger.order_count().await, 1);
    // The rejected cart is left for the guest to adjust.
    let cart = h.carts.get_cart(h.tenant, "second").await.unwrap();
    assert_eq!(cart.quantity_of(soto), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_never_oversell() {
    let h = Harness::new().await;
    let stock = 3;
    let guests = 8;
    let martabak = h.product("Martabak", stock).await;

    for g in 0..guests {
        h.carts
            .add_item(h.tenant, &format!("guest-{g}"), martabak, 1)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for g in 0..guests {
        let checkout = h.checkout.clone();
        let tenant = h.tenant;
        handles.push(tokio::spawn(async move {
            checkout
                .checkout(tenant, &format!("guest-{g}"), &pickup("Guest"))
                .await
        }));
    }

    let mut succeeded = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(DomainError::InsufficientInventory(_)) => rejected += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(succeeded, stock);
    assert_eq!(rejected, guests - stock);
    let held = h
        .ledger
        .product_stock(h.tenant, martabak)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(held.reserved_quantity, stock);
    assert_eq!(held.available(), 0);
}

#[tokio::test]
async fn delivery_fee_comes_from_the_distance_tier() {
    let h = Harness::new().await;
    let bakso = h.product("Bakso", 10).await;
    h.carts.add_item(h.tenant, "guest", bakso, 1).await.unwrap();

    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &delivery_to("Rina", NEAR_ADDRESS))
        .await
        .unwrap();

    assert_eq!(receipt.total, UNIT_PRICE + 8000);
    let view = h.orders.get_order(h.tenant, &receipt.order_reference).await.unwrap();
    let delivery = view.delivery.unwrap();
    assert_eq!(delivery.fee, 8000);
    assert_eq!(delivery.address, NEAR_ADDRESS);
    assert!(delivery.distance_km.unwrap() < 3.0);
}

#[tokio::test]
async fn total_overflow_is_rejected_without_an_order() {
    let h = Harness::new().await;
    let caviar = h.priced_product("Caviar", 1, i64::MAX - 1000).await;
    let lines = BTreeMap::from([(caviar, 1)]);

    let err = h
        .checkout
        .create_order(h.tenant, &lines, &delivery_to("Rani", NEAR_ADDRESS))
        .await
        .unwrap_err();

    assert!(matches!(err, DomainError::InvalidRequest(_)));
    assert_eq!(h.ledger.order_count().await, 0);

    let created = h
        .checkout
        .create_order(h.tenant, &lines, &pickup("Rani"))
        .await
        .unwrap();
    assert_eq!(created.order.total, i64::MAX - 1000);
}

#[tokio::test]
async fn unserviceable_address_creates_no_order() {
    let h = Harness::new().await;
    let bakso = h.product("Bakso", 10).await;
    h.carts.add_item(h.tenant, "guest", bakso, 2).await.unwrap();

    for address in [FAR_ADDRESS, "Somewhere unknown"] {
        let err = h
            .checkout
            .checkout(h.tenant, "guest", &delivery_to("Rina", address))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::AddressNotServiceable));
    }

    assert_eq!(h.ledger.order_count().await, 0);
    let stock = h.ledger.product_stock(h.tenant, bakso).await.unwrap().unwrap();
    assert_eq!(stock.reserved_quantity, 0);
    let cart = h.carts.get_cart(h.tenant, "guest").await.unwrap();
    assert_eq!(cart.quantity_of(bakso), 2);
}

#[tokio::test]
async fn settlement_notification_pays_once() {
    let h = Harness::new().await;
    let gudeg = h.product("Gudeg", 4).await;
    h.carts.add_item(h.tenant, "guest", gudeg, 2).await.unwrap();
    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &pickup("Tono"))
        .await
        .unwrap();
    let body = midtrans_body("tx-100", &receipt.order_reference, "settlement", receipt.total);

    let first = h
        .webhook
        .process(GatewayKind::Midtrans, &body, None)
        .await
        .unwrap();
    let second = h
        .webhook
        .process(GatewayKind::Midtrans, &body, None)
        .await
        .unwrap();

    assert!(matches!(first, NotificationOutcome::Paid { .. }));
    assert_eq!(second, NotificationOutcome::Duplicate);

    let details = h.details(&receipt.order_reference).await;
    assert_eq!(details.order.status, OrderStatus::Paid);
    assert!(details.order.paid_at.is_some());
    assert!(details
        .reservations
        .iter()
        .all(|r| r.status == ReservationStatus::Converted));

    let stock = h.ledger.product_stock(h.tenant, gudeg).await.unwrap().unwrap();
    assert_eq!(stock.allocated_quantity, 2);
    assert_eq!(stock.reserved_quantity, 0);
    assert_eq!(stock.available(), 2);

    // One intent row plus one notification row.
    let payments = h.ledger.payments_for_order(details.order.id).await;
    assert_eq!(payments.len(), 2);
    let paid_events = h
        .ledger
        .outbox_events()
        .await
        .into_iter()
        .filter(|e| e.event_type == EventType::OrderPaid.as_str())
        .count();
    assert_eq!(paid_events, 1);
}

#[tokio::test]
async fn tampered_notification_is_rejected() {
    let h = Harness::new().await;
    let pecel = h.product("Pecel", 4).await;
    h.carts.add_item(h.tenant, "guest", pecel, 1).await.unwrap();
    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &pickup("Tono"))
        .await
        .unwrap();

    let mut body: serde_json::Value = serde_json::from_slice(&midtrans_body(
        "tx-7",
        &receipt.order_reference,
        "settlement",
        receipt.total,
    ))
    .unwrap();
    body["signature_key"] = serde_json::json!("0".repeat(128));
    let body = serde_json::to_vec(&body).unwrap();

    let err = h
        .webhook
        .process(GatewayKind::Midtrans, &body, None)
        .await
        .unwrap_err();

    assert!(matches!(err, DomainError::InvalidSignature));
    let details = h.details(&receipt.order_reference).await;
    assert_eq!(details.order.status, OrderStatus::Pending);
}

#[tokio::test]
async fn expired_reservations_free_stock_for_the_next_guest() {
    let h = Harness::new().await;
    let lumpia = h.product("Lumpia", 5).await;

    h.carts.add_item(h.tenant, "slow", lumpia, 5).await.unwrap();
    let abandoned = h
        .checkout
        .checkout(h.tenant, "slow", &pickup("Slow"))
        .await
        .unwrap();

    h.pass_minutes(16);
    let report = h.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.released_quantity, 5);

    let details = h.details(&abandoned.order_reference).await;
    assert_eq!(details.reservations[0].status, ReservationStatus::Expired);

    // A second pass finds nothing left to expire.
    assert_eq!(h.sweeper.sweep_once().await.unwrap().expired, 0);

    let (_, outcome) = h.carts.add_item(h.tenant, "fast", lumpia, 5).await.unwrap();
    assert_eq!(outcome, AddOutcome::Added);
    h.checkout
        .checkout(h.tenant, "fast", &pickup("Fast"))
        .await
        .unwrap();

    // The abandoned order's late payment cannot be honoured automatically.
    let late = midtrans_body(
        "tx-late",
        &abandoned.order_reference,
        "settlement",
        abandoned.total,
    );
    let outcome = h
        .webhook
        .process(GatewayKind::Midtrans, &late, None)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        NotificationOutcome::ReconciliationRequired { .. }
    ));
    let cases = h.orders.open_reconciliation_cases(h.tenant).await.unwrap();
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].reason, "reservations_not_active");
    let details = h.details(&abandoned.order_reference).await;
    assert_eq!(details.order.status, OrderStatus::Pending);
}

#[tokio::test]
async fn gateway_failure_keeps_order_for_retry() {
    let h = Harness::new().await;
    let tahu = h.product("Tahu Isi", 10).await;
    h.carts.add_item(h.tenant, "guest", tahu, 3).await.unwrap();

    h.gateway.fail.store(true, Ordering::SeqCst);
    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &pickup("Putri"))
        .await
        .unwrap();
    assert!(receipt.payment_redirect_url.is_none());
    assert_eq!(h.ledger.order_count().await, 1);

    h.gateway.fail.store(false, Ordering::SeqCst);
    let retried = h
        .checkout
        .retry_payment(h.tenant, &receipt.order_reference)
        .await
        .unwrap();
    assert!(retried.payment_redirect_url.is_some());
    assert_eq!(retried.order_reference, receipt.order_reference);
}

#[tokio::test]
async fn retry_after_expiry_is_refused() {
    let h = Harness::new().await;
    let tempe = h.product("Tempe", 10).await;
    h.carts.add_item(h.tenant, "guest", tempe, 1).await.unwrap();
    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &pickup("Putri"))
        .await
        .unwrap();

    // Past expiry even before the sweeper has run.
    h.pass_minutes(16);
    let err = h
        .checkout
        .retry_payment(h.tenant, &receipt.order_reference)
        .await
        .unwrap_err();

    assert!(matches!(err, DomainError::ReservationExpired(_)));
}

#[tokio::test]
async fn retry_on_paid_order_is_refused() {
    let h = Harness::new().await;
    let kopi = h.product("Kopi Tubruk", 10).await;
    h.carts.add_item(h.tenant, "guest", kopi, 1).await.unwrap();
    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &pickup("Adi"))
        .await
        .unwrap();
    h.webhook
        .process(
            GatewayKind::Midtrans,
            &midtrans_body("tx-9", &receipt.order_reference, "settlement", receipt.total),
            None,
        )
        .await
        .unwrap();

    let err = h
        .checkout
        .retry_payment(h.tenant, &receipt.order_reference)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DomainError::InvalidStateTransition {
            from: OrderStatus::Paid,
            ..
        }
    ));
}

#[tokio::test]
async fn staff_cancel_of_pending_order_returns_stock() {
    let h = Harness::new().await;
    let mie = h.product("Mie Ayam", 4).await;
    h.carts.add_item(h.tenant, "guest", mie, 4).await.unwrap();
    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &pickup("Eka"))
        .await
        .unwrap();
    let order_id = h.details(&receipt.order_reference).await.order.id;

    let cancelled = h
        .orders
        .transition_status(h.tenant, order_id, OrderStatus::Cancelled)
        .await
        .unwrap();

    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    let details = h.details(&receipt.order_reference).await;
    assert_eq!(details.reservations[0].status, ReservationStatus::Released);
    let (_, outcome) = h.carts.add_item(h.tenant, "next", mie, 4).await.unwrap();
    assert_eq!(outcome, AddOutcome::Added);

    let err = h
        .orders
        .transition_status(h.tenant, order_id, OrderStatus::Complete)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn staff_complete_requires_payment() {
    let h = Harness::new().await;
    let es = h.product("Es Campur", 4).await;
    h.carts.add_item(h.tenant, "guest", es, 1).await.unwrap();
    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &pickup("Eka"))
        .await
        .unwrap();
    let order_id = h.details(&receipt.order_reference).await.order.id;

    for next in [OrderStatus::Complete, OrderStatus::Paid] {
        let err = h
            .orders
            .transition_status(h.tenant, order_id, next)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }

    h.webhook
        .process(
            GatewayKind::Midtrans,
            &midtrans_body("tx-3", &receipt.order_reference, "settlement", receipt.total),
            None,
        )
        .await
        .unwrap();
    let done = h
        .orders
        .transition_status(h.tenant, order_id, OrderStatus::Complete)
        .await
        .unwrap();

    assert_eq!(done.status, OrderStatus::Complete);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn staff_notes_append_without_changing_status() {
    let h = Harness::new().await;
    let kerupuk = h.product("Kerupuk", 4).await;
    h.carts.add_item(h.tenant, "guest", kerupuk, 1).await.unwrap();
    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &pickup("Eka"))
        .await
        .unwrap();
    let order_id = h.details(&receipt.order_reference).await.order.id;

    h.orders
        .add_staff_note(h.tenant, order_id, "customer called")
        .await
        .unwrap();
    let order = h
        .orders
        .add_staff_note(h.tenant, order_id, "extra sambal")
        .await
        .unwrap();

    let notes = order.staff_notes.unwrap();
    assert_eq!(notes.lines().count(), 2);
    assert!(notes.ends_with("extra sambal"));
    assert_eq!(order.status, OrderStatus::Pending);

    let err = h
        .orders
        .add_staff_note(h.tenant, order_id, "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidRequest(_)));
}

#[tokio::test]
async fn create_order_accepts_a_snapshot_directly() {
    let h = Harness::new().await;
    let pisang = h.product("Pisang Goreng", 6).await;
    let lines = BTreeMap::from([(pisang, 4)]);

    let created = h
        .checkout
        .create_order(h.tenant, &lines, &pickup("Lina"))
        .await
        .unwrap();

    assert_eq!(created.order.subtotal, 4 * UNIT_PRICE);
    assert_eq!(created.reservations.len(), 1);
    assert!(created.quote.is_none());
    assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn orders_are_scoped_to_their_tenant() {
    let h = Harness::new().await;
    let nasi = h.product("Nasi Uduk", 4).await;
    h.carts.add_item(h.tenant, "guest", nasi, 1).await.unwrap();
    let receipt = h
        .checkout
        .checkout(h.tenant, "guest", &pickup("Eka"))
        .await
        .unwrap();

    let err = h
        .orders
        .get_order(uuid::Uuid::new_v4(), &receipt.order_reference)
        .await
        .unwrap_err();

    assert!(matches!(err, DomainError::OrderNotFound(_)));
}
