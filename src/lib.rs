#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

#[path = "../ipca/mod.rs"]
pub mod ipca;
