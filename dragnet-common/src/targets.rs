//! Target-list acquisition: where the raw `host[:port]` lines come from.
//!
//! Providers hand the controller a lazy iterator so that multi-million line
//! lists are never held in memory as parsed targets. The downloaded form
//! understands the common ranked-list shapes: a GZIP or ZIP archive holding
//! a CSV with either `rank,domain` or `protocol://domain,rank` rows.

use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::PathBuf;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("failed to read target list: {0}")]
    Io(#[from] io::Error),
    #[error("failed to download target list: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to open target list archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("target list archive contains no files")]
    EmptyArchive,
    #[error("failed to parse target list row: {0}")]
    Csv(#[from] csv::Error),
}

/// One raw entry from a target list: the `host[:port]` text plus the list
/// rank, when the source carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTarget {
    pub line: String,
    pub rank: Option<u32>,
}

impl RawTarget {
    pub fn plain(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            rank: None,
        }
    }
}

pub type TargetIter = Box<dyn Iterator<Item = Result<RawTarget, TargetError>> + Send>;

/// A source of scan targets. `fetch` performs whatever acquisition the
/// source needs (opening a file, downloading an archive) and returns a lazy
/// line iterator.
#[async_trait]
pub trait TargetListProvider: Send + Sync {
    async fn fetch(&self) -> Result<TargetIter, TargetError>;

    /// Convenience form for callers that want the whole list at once.
    async fn fetch_all(&self) -> Result<Vec<RawTarget>, TargetError> {
        self.fetch().await?.collect()
    }
}

/// Plain-lines file: one `host[:port]` per line, `#` comments and empty
/// lines ignored.
pub struct FileTargets {
    path: PathBuf,
}

impl FileTargets {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TargetListProvider for FileTargets {
    async fn fetch(&self) -> Result<TargetIter, TargetError> {
        let reader = BufReader::new(std::fs::File::open(&self.path)?);
        let iter = reader
            .lines()
            .filter_map(|line| match line {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        None
                    } else {
                        Some(Ok(RawTarget::plain(trimmed)))
                    }
                }
                Err(error) => Some(Err(TargetError::Io(error))),
            });
        Ok(Box::new(iter))
    }
}

/// A ranked list downloaded over HTTP, compressed as GZIP or ZIP.
pub struct DownloadedTargets {
    url: String,
    client: reqwest::Client,
}

impl DownloadedTargets {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TargetListProvider for DownloadedTargets {
    async fn fetch(&self) -> Result<TargetIter, TargetError> {
        let bytes = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let decoded = decompress(bytes.to_vec())?;
        Ok(ranked_csv_targets(decoded))
    }
}

/// Sniff the payload: GZIP and ZIP by magic bytes, anything else passes
/// through as plain text.
fn decompress(bytes: Vec<u8>) -> Result<Vec<u8>, TargetError> {
    match bytes.as_slice() {
        [0x1f, 0x8b, ..] => {
            let mut decoded = Vec::new();
            GzDecoder::new(Cursor::new(bytes)).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
        [b'P', b'K', ..] => {
            let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
            if archive.is_empty() {
                return Err(TargetError::EmptyArchive);
            }
            let mut decoded = Vec::new();
            archive.by_index(0)?.read_to_end(&mut decoded)?;
            Ok(decoded)
        }
        _ => Ok(bytes),
    }
}

/// Lazily parse CSV rows in either `rank,domain` or
/// `protocol://domain,rank` form.
fn ranked_csv_targets(decoded: Vec<u8>) -> TargetIter {
    let reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(decoded));

    let iter = reader.into_records().filter_map(|record| match record {
        Ok(record) => {
            let first = record.get(0)?.trim();
            if first.is_empty() {
                return None;
            }
            let second = record.get(1).map(str::trim);
            let raw = if let Ok(rank) = first.parse::<u32>() {
                // `rank,domain`
                let domain = second?;
                RawTarget {
                    line: strip_scheme(domain).to_owned(),
                    rank: Some(rank),
                }
            } else {
                // `protocol://domain,rank`
                RawTarget {
                    line: strip_scheme(first).to_owned(),
                    rank: second.and_then(|s| s.parse().ok()),
                }
            };
            Some(Ok(raw))
        }
        Err(error) => Some(Err(TargetError::Csv(error))),
    });
    Box::new(iter)
}

fn strip_scheme(domain: &str) -> &str {
    match domain.split_once("://") {
        Some((_, rest)) => rest,
        None => domain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[tokio::test]
    async fn file_targets_skip_comments_and_blanks() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("dragnet-targets-{}", std::process::id()));
        std::fs::write(&path, "# hosts\nexample.com\n\nexample.org:8443\n").unwrap();

        let targets = FileTargets::new(&path).fetch_all().await.unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(
            targets,
            vec![
                RawTarget::plain("example.com"),
                RawTarget::plain("example.org:8443"),
            ]
        );
    }

    #[test]
    fn parses_rank_domain_rows() {
        let rows = b"1,example.com\n2,example.org\n".to_vec();
        let targets: Vec<RawTarget> =
            ranked_csv_targets(rows).collect::<Result<_, _>>().unwrap();
        assert_eq!(targets[0].line, "example.com");
        assert_eq!(targets[0].rank, Some(1));
        assert_eq!(targets[1].rank, Some(2));
    }

    #[test]
    fn parses_protocol_domain_rank_rows() {
        let rows = b"https://example.com,7\nhttp://example.org,9\n".to_vec();
        let targets: Vec<RawTarget> =
            ranked_csv_targets(rows).collect::<Result<_, _>>().unwrap();
        assert_eq!(targets[0].line, "example.com");
        assert_eq!(targets[0].rank, Some(7));
        assert_eq!(targets[1].line, "example.org");
        assert_eq!(targets[1].rank, Some(9));
    }

    #[test]
    fn gzip_payloads_are_sniffed_and_decoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"1,example.com\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decompress(compressed).unwrap();
        let targets: Vec<RawTarget> =
            ranked_csv_targets(decoded).collect::<Result<_, _>>().unwrap();
        assert_eq!(targets, vec![RawTarget { line: "example.com".into(), rank: Some(1) }]);
    }

    #[test]
    fn zip_payloads_use_the_first_entry() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("list.csv", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"1,example.com\n").unwrap();
            writer.finish().unwrap();
        }

        let decoded = decompress(buffer.into_inner()).unwrap();
        let targets: Vec<RawTarget> =
            ranked_csv_targets(decoded).collect::<Result<_, _>>().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].line, "example.com");
    }

    #[test]
    fn plain_payloads_pass_through() {
        let decoded = decompress(b"1,example.com\n".to_vec()).unwrap();
        assert_eq!(decoded, b"1,example.com\n");
    }
}
