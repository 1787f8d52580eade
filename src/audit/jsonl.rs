use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;

use crate::{AuditSink, Envelope, Result};

struct DailyFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

/// An audit sink appending each envelope as one JSON line to a daily file,
/// `<dir>/ipc-audit-YYYY-MM-DD.log` (local date).
///
/// Optionally restricted to a set of domains, to keep the log to the
/// business-critical traffic.
pub struct JsonlAudit {
    dir: PathBuf,
    domains: Option<HashSet<String>>,
    file: Mutex<Option<DailyFile>>,
}

impl JsonlAudit {
    /// Create a sink writing to `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            domains: None,
            file: Mutex::new(None),
        })
    }

    /// Only record envelopes of the given domains.
    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = Some(domains.into_iter().map(Into::into).collect());
        self
    }

    /// The file envelopes recorded on `date` go to.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("ipc-audit-{}.log", date.format("%Y-%m-%d")))
    }

    fn records(&self, envelope: &Envelope) -> bool {
        self.domains
            .as_ref()
            .is_none_or(|domains| domains.contains(&envelope.domain))
    }

    fn open(&self, date: NaiveDate) -> std::io::Result<DailyFile> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(date))?;
        Ok(DailyFile {
            date,
            writer: BufWriter::new(file),
        })
    }
}

impl AuditSink for JsonlAudit {
    fn record(&self, envelope: &Envelope) -> Result {
        if !self.records(envelope) {
            return Ok(());
        }

        let today = Local::now().date_naive();
        let mut file = self.file.lock();
        if file.as_ref().is_none_or(|f| f.date != today) {
            *file = Some(self.open(today)?);
        }
        if let Some(daily) = file.as_mut() {
            serde_json::to_writer(&mut daily.writer, envelope)?;
            daily.writer.write_all(b"\n")?;
            daily.writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("switchboard-audit-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_jsonl_audit_appends_lines() {
        let dir = temp_dir();
        let audit = JsonlAudit::new(&dir).unwrap();

        let first = Envelope::new("RISK_CHECK", "risk", "workbench")
            .with_payload(json!({"customerId": "C-001", "amount": 5000}));
        let second = Envelope::new("LOCK_CUSTOMER", "crm", "workbench");
        audit.record(&first).unwrap();
        audit.record(&second).unwrap();

        let content = fs::read_to_string(audit.path_for(Local::now().date_naive())).unwrap();
        let lines: Vec<Envelope> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines, vec![first, second]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_jsonl_audit_domain_filter() {
        let dir = temp_dir();
        let audit = JsonlAudit::new(&dir)
            .unwrap()
            .with_domains(["crm", "risk", "ticket"]);

        audit.record(&Envelope::new("LOG", "demo", "renderer")).unwrap();
        assert!(!audit.path_for(Local::now().date_naive()).exists());

        audit
            .record(&Envelope::new("TICKET_DONE", "ticket", "partner:auto"))
            .unwrap();
        let content = fs::read_to_string(audit.path_for(Local::now().date_naive())).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("TICKET_DONE"));

        let _ = fs::remove_dir_all(dir);
    }
}
