pub mod csv_log;
pub mod event_logging;
pub mod one_wire;
