use crate::config::ServerConfig;
use crate::error::AppError;
use env_logger::Builder;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Log file that receives a plain copy of every line.
struct LogMirror {
    file: File,
    path: PathBuf,
    failed: AtomicBool,
}

impl LogMirror {
    /// Appends one line. The first failure is reported on stderr and later
    /// ones stay quiet; returns whether this call reported.
    fn write_line(&self, line: &str) -> bool {
        let result = writeln!(&self.file, "{line}");
        match result {
            Ok(()) => false,
            Err(e) => {
                if self.failed.swap(true, Ordering::Relaxed) {
                    return false;
                }
                eprintln!(
                    "Failed to write to log file '{}': {e}; further errors are not reported",
                    self.path.display()
                );
                true
            }
        }
    }
}

/// Installs the global logger.
///
/// The filter uses `RUST_LOG` syntax and defaults to `info`. When a log file
/// is configured every line is mirrored there without terminal colors.
pub fn init(config: &ServerConfig) -> Result<(), AppError> {
    let mirror = match &config.log_file {
        Some(path) => Some(LogMirror {
            file: OpenOptions::new().create(true).append(true).open(path)?,
            path: path.clone(),
            failed: AtomicBool::new(false),
        }),
        None => None,
    };

    let mut builder = Builder::new();
    builder.parse_filters(&config.log_level);
    builder.format(move |buf, record| {
        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
        let module = record.module_path().unwrap_or_default();

        if let Some(mirror) = &mirror {
            mirror.write_line(&format!(
                "[{timestamp} {} {module}] {}",
                record.level(),
                record.args()
            ));
        }

        let style = buf.default_level_style(record.level());
        writeln!(
            buf,
            "[{timestamp} {style}{}{style:#} {module}] {}",
            record.level(),
            record.args()
        )
    });

    builder
        .try_init()
        .map_err(|e| AppError::InvalidConfig(format!("logger already initialized: {e}")))
}
