#![deny(dead_code)]
#![deny(unused_imports)]

pub mod analysis;
pub mod data;
pub mod design;
pub mod diagnostics;
pub mod family;
pub mod fit;
pub mod margins;
pub mod model;
pub mod recode;
pub mod report;
