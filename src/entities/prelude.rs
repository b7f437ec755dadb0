pub use super::bill_orders::Entity as BillOrders;
pub use super::bills::Entity as Bills;
pub use super::dining_tables::Entity as DiningTables;
pub use super::order_items::Entity as OrderItems;
pub use super::order_status_logs::Entity as OrderStatusLogs;
pub use super::orders::Entity as Orders;
pub use super::payments::Entity as Payments;
