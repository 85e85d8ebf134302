pub mod poll_record;
pub mod reading;
pub mod sensor_id;
pub mod temperature;
