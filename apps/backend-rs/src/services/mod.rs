pub mod audit;
pub mod availability;
pub mod booking_data;
pub mod completion;
pub mod contracts;
pub mod customer_profile;
pub mod document_numbers;
pub mod email;
pub mod inspection_report;
pub mod invoicing;
pub mod maintenance;
pub mod money;
pub mod pdf;
pub mod pricing;
pub mod quote;
pub mod reconciliation;
pub mod retry;
pub mod review_request;
pub mod storage;
pub mod templates;
