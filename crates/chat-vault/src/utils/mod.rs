//! Utilities module - text helpers shared by the store and the API

pub mod text_utils;

pub use text_utils::TextUtils;
