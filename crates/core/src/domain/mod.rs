pub mod approval;
pub mod conversation;
pub mod customer;
pub mod idempotency;
pub mod product;
pub mod response;
