#![allow(dead_code)]

pub mod http;
pub mod uplift_env;
