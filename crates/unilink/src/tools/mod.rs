pub mod links;
pub mod migrate;
pub mod resolve;
