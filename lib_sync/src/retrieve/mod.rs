//! HTTP retrieval utilities shared by the polling components.

pub mod http;
