mod meta_db;

pub use meta_db::*;
