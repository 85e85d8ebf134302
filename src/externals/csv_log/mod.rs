use self::writer::{LogWriter, LogWriterConfig};

pub mod filter;
pub mod writer;

pub struct CsvLogModule {
    pub log_writer: LogWriter,
}

impl CsvLogModule {
    pub fn initialize(config: LogWriterConfig) -> Self {
        Self {
            log_writer: LogWriter::new(config),
        }
    }
}
