mod common;

use chrono::Utc;
use dinein_backend::entities::{bill_orders, bills, payments, prelude::*};
use dinein_backend::error::CoreError;
use dinein_backend::models::order::PlaceOrderItem;
use dinein_backend::models::status::{BillStatus, ItemStatus, OrderStatus, PaymentMethod, TableStatus};
use dinein_backend::services::bill_consolidation::format_bill_code;
use dinein_backend::services::order_intake::NewOrder;
use dinein_backend::services::order_state::ChangeContext;
use dinein_backend::AppState;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, PaginatorTrait, QueryFilter, Set,
};

use crate::common::{seed_open_bill, seed_order, seed_table, test_state};

async fn place(state: &AppState, table_id: i32, items: Vec<(i32, i32, Decimal)>) -> (i32, Vec<i32>) {
    let placed = state
        .intake
        .place_order(NewOrder {
            table_id,
            customer_name: None,
            customer_phone: None,
            notes: None,
            actor: Some("waiter-1".to_string()),
            items: items
                .into_iter()
                .map(|(food_id, quantity, unit_price)| PlaceOrderItem {
                    food_id,
                    quantity,
                    unit_price,
                })
                .collect(),
        })
        .await
        .unwrap();
    (
        placed.order.id,
        placed.items.iter().map(|i| i.id).collect(),
    )
}

async fn open_bill_count(state: &AppState, table_id: i32) -> u64 {
    Bills::find()
        .filter(bills::Column::TableId.eq(table_id))
        .filter(bills::Column::Status.eq(BillStatus::Open))
        .count(&state.db)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_full_table_lifecycle() {
    let (state, sink) = test_state().await;
    let table = seed_table(&state.db, "T").await;
    let today = Utc::now().date_naive();

    // Order A: 2 × Burger @100, preparing. Order B: 1 × Soda @40, pending.
    let (order_a, items_a) = place(&state, table.id, vec![(1, 2, dec!(100))]).await;
    let (order_b, items_b) = place(&state, table.id, vec![(2, 1, dec!(40))]).await;
    state
        .orders
        .transition_item(items_a[0], ItemStatus::Preparing, ChangeContext::default())
        .await
        .unwrap();

    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();
    assert_eq!(bill.bill_code, format_bill_code(table.id, today, 1));
    assert_eq!(bill.status, BillStatus::Open);
    assert_eq!(bill.total_amount, dec!(240));
    assert_eq!(bill.order_ids, vec![order_a, order_b]);

    // Cancelling B's only item cancels B; the next consolidation drops it
    let outcome = state
        .orders
        .transition_item(items_b[0], ItemStatus::Cancelled, ChangeContext::default())
        .await
        .unwrap();
    assert_eq!(outcome.order_status, OrderStatus::Cancelled);

    let rebilled = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();
    assert_eq!(rebilled.bill_id, bill.bill_id);
    assert_eq!(rebilled.total_amount, dec!(200));
    assert_eq!(rebilled.order_ids, vec![order_a]);

    let checkout = state
        .checkout
        .confirm_checkout(bill.bill_id, Some("cashier".to_string()))
        .await
        .unwrap();
    assert_eq!(checkout.bill.status, BillStatus::PendingPayment);
    assert_eq!(checkout.bill.total_amount, dec!(200));
    assert_eq!(checkout.completed_order_ids, vec![order_a]);

    let a = state.orders.get_order(order_a).await.unwrap();
    assert_eq!(a.order.status, OrderStatus::Completed);
    let reloaded_table = DiningTables::find_by_id(table.id).one(&state.db).await.unwrap().unwrap();
    assert_eq!(reloaded_table.status, TableStatus::Available);

    let paid = state
        .checkout
        .mark_paid(bill.bill_id, PaymentMethod::Cash, Some("cashier".to_string()))
        .await
        .unwrap();
    assert_eq!(paid.amount, dec!(200));
    assert_eq!(paid.method, PaymentMethod::Cash);

    let detail = state.bills.bill_detail(bill.bill_id).await.unwrap();
    assert_eq!(detail.bill.status, BillStatus::Paid);
    assert_eq!(detail.payments.len(), 1);
    assert_eq!(detail.payments[0].order_id, Some(order_a));
    assert_eq!(detail.payments[0].status, "paid");

    let actions = sink.wait_for_audits(7).await;
    assert!(actions.contains(&"bill.opened".to_string()));
    assert!(actions.contains(&"bill.checkout_confirmed".to_string()));
    assert!(actions.contains(&"bill.paid".to_string()));
}

#[tokio::test]
async fn test_ensure_open_bill_is_idempotent() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "idem").await;
    seed_order(&state.db, table.id, &[(1, 3, dec!(2.50), ItemStatus::Served)]).await;
    seed_order(&state.db, table.id, &[(2, 1, dec!(9.99), ItemStatus::Pending)]).await;

    let first = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();
    let second = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();

    assert_eq!(first.bill_id, second.bill_id);
    assert_eq!(first.bill_code, second.bill_code);
    assert_eq!(second.total_amount, dec!(17.49));
    assert_eq!(first.order_ids, second.order_ids);
    assert_eq!(open_bill_count(&state, table.id).await, 1);

    let links = BillOrders::find()
        .filter(bill_orders::Column::BillId.eq(first.bill_id))
        .count(&state.db)
        .await
        .unwrap();
    assert_eq!(links, 2);
}

#[tokio::test]
async fn test_ensure_open_bill_without_billable_orders() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "empty").await;
    assert!(state.bills.ensure_open_bill(table.id).await.unwrap().is_none());

    // An active order whose items are all cancelled is a ghost
    let ghost = seed_order(&state.db, table.id, &[(1, 1, dec!(5), ItemStatus::Cancelled)]).await;
    // Seeded as cancelled by derivation; force it back to an active status
    let mut model = ghost.order.clone().into_active_model();
    model.status = Set(OrderStatus::Pending);
    model.update(&state.db).await.unwrap();

    assert!(state.bills.ensure_open_bill(table.id).await.unwrap().is_none());
    let order = state.orders.get_order(ghost.order.id).await.unwrap();
    assert_eq!(order.order.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_ghost_bill_removed_after_orders_cancelled() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "ghost").await;
    let seeded = seed_order(&state.db, table.id, &[(1, 1, dec!(10), ItemStatus::Pending)]).await;

    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();
    state
        .orders
        .transition_order(seeded.order.id, OrderStatus::Cancelled, ChangeContext::default())
        .await
        .unwrap();

    assert!(state.bills.ensure_open_bill(table.id).await.unwrap().is_none());
    assert!(Bills::find_by_id(bill.bill_id).one(&state.db).await.unwrap().is_none());
    assert_eq!(open_bill_count(&state, table.id).await, 0);
}

#[tokio::test]
async fn test_list_open_orders_skips_orders_without_live_items() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "list").await;
    let live = seed_order(&state.db, table.id, &[(1, 1, dec!(10), ItemStatus::Preparing)]).await;
    seed_order(&state.db, table.id, &[(2, 1, dec!(4), ItemStatus::Cancelled)]).await;

    let open = state.bills.list_open_orders(table.id).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].order.id, live.order.id);
}

#[tokio::test]
async fn test_checkout_with_nothing_billable_keeps_bill_open() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "zero").await;
    let seeded = seed_order(&state.db, table.id, &[(1, 1, dec!(40), ItemStatus::Pending)]).await;
    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();

    state
        .orders
        .transition_item(seeded.items[0].id, ItemStatus::Cancelled, ChangeContext::default())
        .await
        .unwrap();

    let err = state.checkout.confirm_checkout(bill.bill_id, None).await.unwrap_err();
    match err {
        CoreError::Conflict(msg) => assert_eq!(msg, "nothing to checkout"),
        other => panic!("unexpected error: {other:?}"),
    }

    let reloaded = Bills::find_by_id(bill.bill_id).one(&state.db).await.unwrap().unwrap();
    assert_eq!(reloaded.status, BillStatus::Open);
}

#[tokio::test]
async fn test_mark_paid_requires_checkout() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "early").await;
    seed_order(&state.db, table.id, &[(1, 1, dec!(40), ItemStatus::Served)]).await;
    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();

    let err = state
        .checkout
        .mark_paid(bill.bill_id, PaymentMethod::Card, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    let payments = Payments::find()
        .filter(payments::Column::BillId.eq(bill.bill_id))
        .count(&state.db)
        .await
        .unwrap();
    assert_eq!(payments, 0);
}

#[tokio::test]
async fn test_second_checkout_is_rejected() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "twice").await;
    seed_order(&state.db, table.id, &[(1, 1, dec!(40), ItemStatus::Served)]).await;
    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();

    state.checkout.confirm_checkout(bill.bill_id, None).await.unwrap();
    let err = state.checkout.confirm_checkout(bill.bill_id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
}

#[tokio::test]
async fn test_new_bill_blocked_while_awaiting_payment() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "blocked").await;
    seed_order(&state.db, table.id, &[(1, 1, dec!(40), ItemStatus::Served)]).await;
    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();
    state.checkout.confirm_checkout(bill.bill_id, None).await.unwrap();

    seed_order(&state.db, table.id, &[(2, 1, dec!(15), ItemStatus::Pending)]).await;
    let err = state.bills.ensure_open_bill(table.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    state
        .checkout
        .mark_paid(bill.bill_id, PaymentMethod::Qr, None)
        .await
        .unwrap();
    let next = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();
    assert_ne!(next.bill_id, bill.bill_id);
    assert_eq!(
        next.bill_code,
        format_bill_code(table.id, Utc::now().date_naive(), 2)
    );
    assert_eq!(next.total_amount, dec!(15));
}

#[tokio::test]
async fn test_concurrent_mark_paid_records_one_payment() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "race").await;
    seed_order(&state.db, table.id, &[(1, 2, dec!(100), ItemStatus::Served)]).await;
    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();
    state.checkout.confirm_checkout(bill.bill_id, None).await.unwrap();

    let (a, b) = tokio::join!(
        state.checkout.mark_paid(bill.bill_id, PaymentMethod::Cash, None),
        state.checkout.mark_paid(bill.bill_id, PaymentMethod::Card, None),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, CoreError::Conflict(_))));

    let payments = Payments::find()
        .filter(payments::Column::BillId.eq(bill.bill_id))
        .count(&state.db)
        .await
        .unwrap();
    assert_eq!(payments, 1);
}

#[tokio::test]
async fn test_concurrent_ensure_open_bill_converges() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "converge").await;
    seed_order(&state.db, table.id, &[(1, 1, dec!(12), ItemStatus::Pending)]).await;

    let (a, b) = tokio::join!(
        state.bills.ensure_open_bill(table.id),
        state.bills.ensure_open_bill(table.id),
    );
    let a = a.unwrap().unwrap();
    let b = b.unwrap().unwrap();

    assert_eq!(a.bill_id, b.bill_id);
    assert_eq!(open_bill_count(&state, table.id).await, 1);
}

#[tokio::test]
async fn test_stray_open_bills_are_merged() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "merge").await;
    let today = Utc::now().date_naive();
    let first = seed_order(&state.db, table.id, &[(1, 2, dec!(100), ItemStatus::Served)]).await;
    let second = seed_order(&state.db, table.id, &[(2, 1, dec!(40), ItemStatus::Pending)]).await;

    let kept = seed_open_bill(
        &state.db,
        table.id,
        &format_bill_code(table.id, today, 1),
        &[first.order.id],
    )
    .await;
    let stray = seed_open_bill(
        &state.db,
        table.id,
        &format_bill_code(table.id, today, 2),
        &[second.order.id],
    )
    .await;

    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();
    assert_eq!(bill.bill_id, kept.id);
    assert_eq!(bill.order_ids, vec![first.order.id, second.order.id]);
    assert_eq!(bill.total_amount, dec!(240));
    assert_eq!(open_bill_count(&state, table.id).await, 1);
    assert!(Bills::find_by_id(stray.id).one(&state.db).await.unwrap().is_none());
}

#[tokio::test]
async fn test_checkout_deletes_other_open_bills() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "stray").await;
    seed_order(&state.db, table.id, &[(1, 1, dec!(30), ItemStatus::Served)]).await;
    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();

    let stray = seed_open_bill(
        &state.db,
        table.id,
        &format_bill_code(table.id, Utc::now().date_naive(), 9),
        &[],
    )
    .await;
    assert_eq!(open_bill_count(&state, table.id).await, 2);

    let outcome = state.checkout.confirm_checkout(bill.bill_id, None).await.unwrap();
    assert_eq!(outcome.bill.total_amount, dec!(30));
    assert_eq!(open_bill_count(&state, table.id).await, 0);
    assert!(Bills::find_by_id(stray.id).one(&state.db).await.unwrap().is_none());
}

#[tokio::test]
async fn test_checkout_total_agrees_with_concurrent_item_cancel() {
    let (state, _) = test_state().await;
    let table = seed_table(&state.db, "cancel-race").await;
    let seeded = seed_order(
        &state.db,
        table.id,
        &[
            (1, 2, dec!(100), ItemStatus::Served),
            (2, 1, dec!(40), ItemStatus::Pending),
        ],
    )
    .await;
    let bill = state.bills.ensure_open_bill(table.id).await.unwrap().unwrap();
    assert_eq!(bill.total_amount, dec!(240));

    let (checkout, cancel) = tokio::join!(
        state.checkout.confirm_checkout(bill.bill_id, None),
        state.orders.transition_item(
            seeded.items[1].id,
            ItemStatus::Cancelled,
            ChangeContext::default()
        ),
    );
    let checkout = checkout.unwrap();

    // Either the cancel landed first and is billed out, or checkout won and
    // the completed order refuses the change
    let order = state.orders.get_order(seeded.order.id).await.unwrap();
    assert_eq!(order.order.status, OrderStatus::Completed);
    assert_eq!(checkout.bill.total_amount, order.order.total_amount);
    match cancel {
        Ok(_) => assert_eq!(checkout.bill.total_amount, dec!(200)),
        Err(err) => {
            assert!(matches!(err, CoreError::Conflict(_)));
            assert_eq!(checkout.bill.total_amount, dec!(240));
        }
    }
}
