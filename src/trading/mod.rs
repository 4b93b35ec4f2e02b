pub mod balance;
pub mod dust;
pub mod fees;
pub mod grid;
pub mod order_handler;
pub mod recovery;
pub mod registry;
pub mod shift;
pub mod supervisor;
pub mod tp;
pub mod trailing;
pub mod types;
