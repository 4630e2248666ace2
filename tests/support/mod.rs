#![allow(dead_code)]

pub mod mocks;
pub mod wait;
