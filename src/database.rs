//! The on-disk CA database: `index.txt`, the serial counter and the lock.
//!
//! Both files use the layouts written by `openssl ca`, so a directory
//! managed by this crate can still be inspected with the OpenSSL tools.
//!
//! ```text
//! V<TAB>YYMMDDHHMMSSZ<TAB><TAB>SERIAL<TAB>unknown<TAB>/C=US/CN=host
//! ```

use crate::errors::{Error, Result};
use core::{cmp::Ordering, fmt};
use der::DateTime;
use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};
use x509_cert::serial_number::SerialNumber;

/// Certificate serial number, big-endian without leading zero bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Serial(Vec<u8>);

impl Serial {
    /// Parse hexadecimal text as found in the serial file and index.
    pub fn from_hex(text: &str) -> core::result::Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty serial".into());
        }
        if !text.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("serial `{text}` is not hexadecimal"));
        }
        let padded = if text.len() % 2 == 1 {
            format!("0{text}")
        } else {
            text.to_owned()
        };
        let bytes = (0..padded.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&padded[i..i + 2], 16))
            .collect::<core::result::Result<Vec<u8>, _>>()
            .map_err(|e| e.to_string())?;
        Ok(Self::from_be_bytes(&bytes))
    }

    /// Build from big-endian bytes, stripping leading zeros.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        let mut digits = bytes[start..].to_vec();
        if digits.is_empty() {
            digits.push(0);
        }
        Serial(digits)
    }

    /// Big-endian bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Uppercase hex with an even number of digits, as OpenSSL writes it.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }

    /// The following serial.
    pub fn next(&self) -> Self {
        let mut digits = self.0.clone();
        for byte in digits.iter_mut().rev() {
            let (sum, carry) = byte.overflowing_add(1);
            *byte = sum;
            if !carry {
                return Serial(digits);
            }
        }
        digits.insert(0, 1);
        Serial(digits)
    }

    /// Encode as an X.509 certificate serial number.
    pub fn to_serial_number(&self) -> Result<SerialNumber> {
        Ok(SerialNumber::new(&self.0)?)
    }
}

impl From<u64> for Serial {
    fn from(n: u64) -> Self {
        Self::from_be_bytes(&n.to_be_bytes())
    }
}

impl Ord for Serial {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Serial {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Database status flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// `V`
    Valid,
    /// `R`
    Revoked,
    /// `E`
    Expired,
}

impl Status {
    fn as_char(self) -> char {
        match self {
            Status::Valid => 'V',
            Status::Revoked => 'R',
            Status::Expired => 'E',
        }
    }
}

/// One line of `index.txt`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Status flag.
    pub status: Status,
    /// `notAfter` of the certificate.
    pub expires: DateTime,
    /// Revocation time for revoked entries, kept verbatim.
    pub revoked: Option<String>,
    /// Certificate serial.
    pub serial: Serial,
    /// File name column; OpenSSL always writes `unknown`.
    pub file: String,
    /// Oneline subject, e.g. `/C=US/CN=host`.
    pub subject: String,
}

impl Entry {
    /// New valid entry.
    pub fn valid(serial: Serial, expires: DateTime, subject: impl Into<String>) -> Self {
        Self {
            status: Status::Valid,
            expires,
            revoked: None,
            serial,
            file: "unknown".into(),
            subject: subject.into(),
        }
    }

    fn parse(line: &str) -> core::result::Result<Self, String> {
        let cols: Vec<&str> = line.split('\t').collect();
        let [status, expires, revoked, serial, file, subject] = cols.as_slice() else {
            return Err(format!("expected 6 tab-separated columns, found {}", cols.len()));
        };

        let status = match *status {
            "V" => Status::Valid,
            "R" => Status::Revoked,
            "E" => Status::Expired,
            other => return Err(format!("unknown status `{other}`")),
        };
        let revoked = match (status, *revoked) {
            (Status::Revoked, "") => return Err("revoked entry without revocation date".into()),
            (Status::Revoked, r) => Some(r.to_owned()),
            (_, "") => None,
            (_, r) => return Err(format!("unexpected revocation date `{r}` on unrevoked entry")),
        };
        if !subject.starts_with('/') {
            return Err(format!("subject `{subject}` is not in oneline form"));
        }

        Ok(Self {
            status,
            expires: parse_time(expires)?,
            revoked,
            serial: Serial::from_hex(serial)?,
            file: (*file).to_owned(),
            subject: (*subject).to_owned(),
        })
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.status.as_char(),
            format_time(&self.expires),
            self.revoked.as_deref().unwrap_or(""),
            self.serial,
            self.file,
            self.subject
        )
    }
}

/// `YYMMDDHHMMSSZ` before 2050, `YYYYMMDDHHMMSSZ` from 2050 on.
pub fn format_time(t: &DateTime) -> String {
    let year = t.year();
    let year = if (1950..2050).contains(&year) {
        format!("{:02}", year % 100)
    } else {
        format!("{year:04}")
    };
    format!(
        "{year}{:02}{:02}{:02}{:02}{:02}Z",
        t.month(),
        t.day(),
        t.hour(),
        t.minutes(),
        t.seconds()
    )
}

fn parse_time(text: &str) -> core::result::Result<DateTime, String> {
    let digits = text
        .strip_suffix('Z')
        .filter(|d| d.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| format!("malformed time `{text}`"))?;
    let num = |range: core::ops::Range<usize>| -> u16 {
        digits[range].parse().unwrap_or_default()
    };
    let (year, rest) = match digits.len() {
        12 => {
            let yy = num(0..2);
            (if yy >= 50 { 1900 + yy } else { 2000 + yy }, 2)
        }
        14 => (num(0..4), 4),
        _ => return Err(format!("malformed time `{text}`")),
    };
    DateTime::new(
        year,
        num(rest..rest + 2) as u8,
        num(rest + 2..rest + 4) as u8,
        num(rest + 4..rest + 6) as u8,
        num(rest + 6..rest + 8) as u8,
        num(rest + 8..rest + 10) as u8,
    )
    .map_err(|e| format!("invalid time `{text}`: {e}"))
}

/// Parsed `index.txt`.
#[derive(Clone, Debug)]
pub struct Database {
    path: PathBuf,
    raw: String,
    entries: Vec<Entry>,
    unique_subject: Option<bool>,
}

impl Database {
    /// Load and validate the index at `path`. Any malformed line or repeated
    /// serial makes the whole database unusable.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::corrupt(path, "index file does not exist"))
            }
            Err(e) => return Err(Error::io(path, e)),
        };
        if !raw.is_empty() && !raw.ends_with('\n') {
            return Err(Error::corrupt(path, "last line is not terminated"));
        }

        let mut entries: Vec<Entry> = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let entry = Entry::parse(line)
                .map_err(|reason| Error::corrupt(path, format!("line {}: {reason}", idx + 1)))?;
            if entries.iter().any(|e| e.serial == entry.serial) {
                return Err(Error::corrupt(
                    path,
                    format!("line {}: serial {} appears twice", idx + 1, entry.serial),
                ));
            }
            entries.push(entry);
        }

        let unique_subject = read_attr(&attr_path(path))?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "loaded CA database");

        Ok(Self {
            path: path.to_owned(),
            raw,
            entries,
            unique_subject,
        })
    }

    /// Create an empty index and its attribute file. Fails if the index
    /// already exists.
    pub fn create(path: impl AsRef<Path>, unique_subject: bool) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        write_attr(&attr_path(path), unique_subject)?;
        Ok(Self {
            path: path.to_owned(),
            raw: String::new(),
            entries: Vec::new(),
            unique_subject: Some(unique_subject),
        })
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries in file order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Highest serial recorded.
    pub fn last_serial(&self) -> Option<&Serial> {
        self.entries.iter().map(|e| &e.serial).max()
    }

    /// `unique_subject` from `index.txt.attr`, if that file exists.
    pub fn unique_subject(&self) -> Option<bool> {
        self.unique_subject
    }

    /// Valid entry for `subject`, if any.
    pub fn find_valid(&self, subject: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.status == Status::Valid && e.subject == subject)
    }

    /// Append `entry`, keeping the previous index as `<index>.old`.
    pub fn append(&mut self, entry: Entry) -> Result<()> {
        if self.entries.iter().any(|e| e.serial == entry.serial) {
            return Err(Error::corrupt(
                &self.path,
                format!("refusing to reuse serial {}", entry.serial),
            ));
        }
        let mut raw = self.raw.clone();
        raw.push_str(&entry.to_string());
        raw.push('\n');
        rotate(&self.path, raw.as_bytes())?;
        if let Some(unique) = self.unique_subject {
            write_attr(&attr_path(&self.path), unique)?;
        }

        tracing::info!(serial = %entry.serial, subject = %entry.subject, "recorded certificate in CA database");
        self.raw = raw;
        self.entries.push(entry);
        Ok(())
    }
}

/// The serial counter file, holding the next serial to issue.
#[derive(Clone, Debug)]
pub struct SerialFile {
    path: PathBuf,
}

impl SerialFile {
    /// Refer to the counter at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the counter file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next serial.
    pub fn read(&self) -> Result<Serial> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::corrupt(&self.path, "serial file does not exist"))
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        };
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let serial = lines
            .next()
            .ok_or_else(|| Error::corrupt(&self.path, "serial file is empty"))?;
        if lines.next().is_some() {
            return Err(Error::corrupt(&self.path, "serial file has extra lines"));
        }
        Serial::from_hex(serial).map_err(|reason| Error::corrupt(&self.path, reason))
    }

    /// Store `serial` as the next one, keeping the previous file as
    /// `<serial>.old`.
    pub fn write(&self, serial: &Serial) -> Result<()> {
        rotate(&self.path, format!("{serial}\n").as_bytes())
    }

    /// Create the counter with `serial` as the first value.
    pub fn create(&self, serial: &Serial) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        file.write_all(format!("{serial}\n").as_bytes())
            .map_err(|e| Error::io(&self.path, e))
    }
}

/// Exclusive lock on a database, held for the duration of one issuance.
///
/// The lock is a `<index>.lock` file created with create-new semantics and
/// removed on drop. It only serializes processes sharing a filesystem.
#[derive(Debug)]
pub struct DatabaseLock {
    path: PathBuf,
}

impl DatabaseLock {
    /// Take the lock for the index at `database`.
    pub fn acquire(database: &Path) -> Result<Self> {
        let path = sibling(database, "lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                // Best effort: the pid only helps humans clear a stale lock.
                let _ = writeln!(file, "{}", std::process::id());
                tracing::debug!(path = %path.display(), "acquired CA database lock");
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::DatabaseLocked(path)),
            Err(e) => Err(Error::io(path, e)),
        }
    }
}

impl Drop for DatabaseLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release CA database lock");
        }
    }
}

/// Expiry for a certificate issued at `now` valid for `days`.
pub fn expiry(now: SystemTime, days: u32) -> Result<(DateTime, DateTime)> {
    let not_after = now + std::time::Duration::from_secs(u64::from(days) * 24 * 60 * 60);
    Ok((
        DateTime::from_system_time(now)?,
        DateTime::from_system_time(not_after)?,
    ))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn attr_path(index: &Path) -> PathBuf {
    sibling(index, "attr")
}

fn read_attr(path: &Path) -> Result<Option<bool>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(path, e)),
    };
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "unique_subject" {
                return match value.trim() {
                    "yes" => Ok(Some(true)),
                    "no" => Ok(Some(false)),
                    other => Err(Error::corrupt(
                        path,
                        format!("unique_subject must be yes or no, got `{other}`"),
                    )),
                };
            }
        }
    }
    Ok(None)
}

fn write_attr(path: &Path, unique_subject: bool) -> Result<()> {
    let value = if unique_subject { "yes" } else { "no" };
    fs::write(path, format!("unique_subject = {value}\n")).map_err(|e| Error::io(path, e))
}

/// Replace `path` with `contents`: write `<path>.new`, move the current file
/// to `<path>.old`, then move the new file into place.
fn rotate(path: &Path, contents: &[u8]) -> Result<()> {
    let new = sibling(path, "new");
    let old = sibling(path, "old");

    let mut file = fs::File::create(&new).map_err(|e| Error::io(&new, e))?;
    file.write_all(contents).map_err(|e| Error::io(&new, e))?;
    file.sync_all().map_err(|e| Error::io(&new, e))?;
    drop(file);

    if path.exists() {
        fs::rename(path, &old).map_err(|e| Error::io(&old, e))?;
    }
    fs::rename(&new, path).map_err(|e| Error::io(path, e))
}
