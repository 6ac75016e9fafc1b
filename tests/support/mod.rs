#![allow(dead_code)]

pub mod mock_api;
pub mod socket_guard;
