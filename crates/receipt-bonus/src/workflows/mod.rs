pub mod payouts;
pub mod receipts;
