#![allow(dead_code)]

pub mod cardlearn_env;
pub mod fakes;
