pub mod grant;
pub mod listener;
pub mod pg_row;
pub mod principal;
pub mod resource;
