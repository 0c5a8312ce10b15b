//! File logging layer: date-stamped lines appended to `logs/out.log`, with
//! warnings and errors mirrored to `logs/error.log`.

use std::{
    fmt::Write as _,
    fs::{File, OpenOptions},
    io::Write as _,
    path::Path,
    sync::{Arc, Mutex},
};

use {
    tracing::{
        Level,
        field::{Field, Visit},
    },
    tracing_subscriber::{Layer, layer::Context},
};

pub struct FileLogLayer {
    out: Arc<Mutex<File>>,
    err: Arc<Mutex<File>>,
}

impl FileLogLayer {
    /// Open (append) `out.log` and `error.log` under `logs_dir`, creating
    /// the directory when missing.
    pub fn new(logs_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let open = |name: &str| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(logs_dir.join(name))
        };
        Ok(Self {
            out: Arc::new(Mutex::new(open("out.log")?)),
            err: Arc::new(Mutex::new(open("error.log")?)),
        })
    }
}

impl<S: tracing::Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let line = format!(
            "{stamp} {:>5} {}: {}{}\n",
            meta.level(),
            meta.target(),
            visitor.message,
            visitor.fields,
        );

        if let Ok(mut out) = self.out.lock() {
            let _ = out.write_all(line.as_bytes());
        }
        if *meta.level() <= Level::WARN
            && let Ok(mut err) = self.err.lock()
        {
            let _ = err.write_all(line.as_bytes());
        }
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tracing_subscriber::layer::SubscriberExt};

    #[test]
    fn writes_date_stamped_lines_and_splits_errors() {
        let dir = tempfile::tempdir().unwrap();
        let layer = FileLogLayer::new(dir.path()).unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(port = 3100, "gateway listening");
            tracing::warn!("low disk space");
            tracing::error!("boom");
        });

        let out = std::fs::read_to_string(dir.path().join("out.log")).unwrap();
        let err = std::fs::read_to_string(dir.path().join("error.log")).unwrap();

        assert!(out.contains("gateway listening"));
        assert!(out.contains("port=3100"));
        assert!(out.contains("low disk space"));
        assert!(out.contains("boom"));
        // Every line starts with an ISO date stamp.
        for line in out.lines() {
            assert!(line.starts_with("20"), "unexpected line: {line}");
            assert!(line.contains('Z'), "unexpected line: {line}");
        }

        assert!(!err.contains("gateway listening"));
        assert!(err.contains("low disk space"));
        assert!(err.contains("boom"));
    }
}
