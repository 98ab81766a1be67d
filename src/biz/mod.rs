pub mod pg_listener;
