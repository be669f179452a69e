use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use zip::ZipArchive;

/// Errors raised while opening or parsing a test-suite archive.
///
/// These are the fatal, suite-level failures: a `run()` caller sees them
/// unwind untouched. Malformed individual test-case entries are *not* errors
/// at this level; they are skipped with a warning during parsing.
#[derive(Error, Debug)]
pub enum SuiteError {
    /// The archive does not contain the required `metadata.xml` entry.
    #[error("Test-suite archive {0:?} does not contain a metadata.xml entry")]
    MissingMetadata(PathBuf),
    #[error("Malformed metadata.xml in {archive:?}: {reason}")]
    MalformedMetadata { archive: PathBuf, reason: String },
    #[error("Test-suite archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Test-suite archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// One test case: an ordered sequence of named input values.
///
/// Order is significant: the harness consumes the values in declaration
/// order. A vector with zero values is legal; the harness aborts the run if
/// the program requests more values than the vector supplies. Immutable
/// after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestVector {
    /// Identifying name, taken from the archive entry's file stem.
    pub name: String,
    /// The archive entry path this vector was parsed from.
    pub origin: PathBuf,
    pub values: Vec<String>,
}

impl TestVector {
    pub fn new(name: impl Into<String>, origin: impl Into<PathBuf>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            values,
        }
    }

    /// The newline-terminated form fed to the target's standard input.
    ///
    /// A zero-value vector yields an empty payload, so the target's first
    /// input request hits end-of-input instead of reading a blank line.
    pub fn stdin_payload(&self) -> String {
        if self.values.is_empty() {
            return String::new();
        }
        let mut payload = self.values.join("\n");
        payload.push('\n');
        payload
    }
}

/// Suite-level fields parsed from `metadata.xml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SuiteMetadata {
    pub architecture: Option<String>,
}

impl SuiteMetadata {
    /// Bitness implied by the architecture hint, when recognizable.
    pub fn bitness(&self) -> Option<u32> {
        let arch = self.architecture.as_deref()?;
        if arch.contains("64") {
            Some(64)
        } else if arch.contains("32") || arch.eq_ignore_ascii_case("i386") {
            Some(32)
        } else {
            None
        }
    }
}

/// A fully parsed test-suite archive, vectors in archive order.
#[derive(Debug, Clone, Default)]
pub struct ParsedSuite {
    pub metadata: SuiteMetadata,
    pub vectors: Vec<TestVector>,
}

/// Parses a zipped test suite: exactly one `metadata.xml` plus any number of
/// `*.xml` test-case entries.
///
/// Entries that fail the test-case shape check (XML declaration line, then a
/// DOCTYPE line naming `testcase`) or do not parse are skipped with a
/// warning; only archive-level problems and a missing `metadata.xml` are
/// fatal.
pub fn parse_suite(archive_path: &Path) -> Result<ParsedSuite, SuiteError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let mut metadata: Option<SuiteMetadata> = None;
    let mut vectors = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let entry_path = PathBuf::from(entry.name());
        let file_name = match entry_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if !file_name.ends_with(".xml") {
            continue;
        }

        let mut text = String::new();
        entry.read_to_string(&mut text)?;

        if file_name == "metadata.xml" {
            metadata = Some(parse_metadata(&text).map_err(|reason| {
                SuiteError::MalformedMetadata {
                    archive: archive_path.to_path_buf(),
                    reason,
                }
            })?);
            continue;
        }

        match parse_testcase(&text) {
            Ok(values) => {
                let name = file_name.trim_end_matches(".xml").to_string();
                vectors.push(TestVector::new(name, entry_path, values));
            }
            Err(reason) => {
                warn!(entry = %entry_path.display(), %reason, "skipping malformed test-case entry");
            }
        }
    }

    let metadata = metadata.ok_or_else(|| SuiteError::MissingMetadata(archive_path.to_path_buf()))?;
    Ok(ParsedSuite { metadata, vectors })
}

/// Parses one test-case XML document into its ordered input values.
///
/// The first two lines must be an XML declaration and a DOCTYPE naming
/// `testcase`; each child element of the root contributes its trimmed text
/// content as one value, in document order.
pub fn parse_testcase(text: &str) -> Result<Vec<String>, String> {
    check_testcase_shape(text)?;

    let mut reader = Reader::from_str(text);
    let mut depth = 0usize;
    let mut current: Option<String> = None;
    let mut values = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                depth += 1;
                if depth == 2 {
                    current = Some(String::new());
                }
            }
            Ok(Event::Empty(_)) => {
                if depth == 1 {
                    values.push(String::new());
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(buffer) = current.as_mut() {
                    let decoded = t.unescape().map_err(|e| e.to_string())?;
                    buffer.push_str(&decoded);
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    let value = current.take().unwrap_or_default();
                    values.push(value.trim().to_string());
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(values)
}

fn check_testcase_shape(text: &str) -> Result<(), String> {
    let mut lines = text.lines();
    let first = lines.next().unwrap_or_default().trim_start();
    if !first.starts_with("<?xml") {
        return Err("first line is not an XML declaration".to_string());
    }
    let second = lines.next().unwrap_or_default();
    if !second.contains("<!DOCTYPE testcase") {
        return Err("second line is not a testcase DOCTYPE".to_string());
    }
    Ok(())
}

/// Parses `metadata.xml`, extracting the `architecture` element if present.
fn parse_metadata(text: &str) -> Result<SuiteMetadata, String> {
    let mut reader = Reader::from_str(text);
    let mut in_architecture = false;
    let mut architecture: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                in_architecture = e.name().as_ref() == b"architecture";
            }
            Ok(Event::Text(t)) => {
                if in_architecture {
                    let decoded = t.unescape().map_err(|e| e.to_string())?;
                    let trimmed = decoded.trim();
                    if !trimmed.is_empty() {
                        architecture = Some(trimmed.to_string());
                    }
                }
            }
            Ok(Event::End(_)) => {
                in_architecture = false;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(SuiteMetadata { architecture })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    const TESTCASE_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"no\"?>\n<!DOCTYPE testcase PUBLIC \"+//IDN sosy-lab.org//DTD test-format testcase 1.1//EN\" \"https://sosy-lab.org/test-format/testcase-1.1.dtd\">\n";

    fn testcase_xml(values: &[&str]) -> String {
        let mut xml = String::from(TESTCASE_HEADER);
        xml.push_str("<testcase>\n");
        for value in values {
            xml.push_str(&format!("  <input>{value}</input>\n"));
        }
        xml.push_str("</testcase>\n");
        xml
    }

    fn metadata_xml(architecture: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?>\n<!DOCTYPE test-metadata PUBLIC \"+//IDN sosy-lab.org//DTD test-format test-metadata 1.1//EN\" \"https://sosy-lab.org/test-format/test-metadata-1.1.dtd\">\n<test-metadata>\n  <architecture>{architecture}</architecture>\n</test-metadata>\n"
        )
    }

    fn write_archive(entries: &[(&str, &str)]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().expect("create temp archive");
        let mut writer = ZipWriter::new(file.reopen().expect("reopen temp archive"));
        for (name, content) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start archive entry");
            writer
                .write_all(content.as_bytes())
                .expect("write archive entry");
        }
        writer.finish().expect("finalize archive");
        file
    }

    #[test]
    fn parse_testcase_preserves_declaration_order() {
        let xml = testcase_xml(&["5", "7", "-3"]);
        let values = parse_testcase(&xml).expect("well-formed testcase must parse");
        assert_eq!(values, vec!["5", "7", "-3"]);
    }

    #[test]
    fn parse_testcase_trims_values_and_accepts_empty_vectors() {
        let xml = testcase_xml(&[" 42 "]);
        assert_eq!(parse_testcase(&xml).unwrap(), vec!["42"]);

        let empty = testcase_xml(&[]);
        assert_eq!(parse_testcase(&empty).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn parse_testcase_rejects_wrong_shape() {
        assert!(
            parse_testcase("<testcase><input>1</input></testcase>").is_err(),
            "missing declaration and DOCTYPE must be rejected"
        );
        assert!(
            parse_testcase("<?xml version=\"1.0\"?>\n<testcase></testcase>").is_err(),
            "missing DOCTYPE line must be rejected"
        );
        assert!(parse_testcase("").is_err(), "empty entry must be rejected");
    }

    #[test]
    fn metadata_architecture_bitness() {
        let meta = parse_metadata(&metadata_xml("x86_64")).unwrap();
        assert_eq!(meta.architecture.as_deref(), Some("x86_64"));
        assert_eq!(meta.bitness(), Some(64));

        let meta32 = parse_metadata(&metadata_xml("i386")).unwrap();
        assert_eq!(meta32.bitness(), Some(32));

        let unknown = parse_metadata("<?xml version=\"1.0\"?><test-metadata/>").unwrap();
        assert_eq!(unknown.architecture, None);
        assert_eq!(unknown.bitness(), None);
    }

    #[test]
    fn parse_suite_reads_vectors_in_archive_order() {
        let archive = write_archive(&[
            ("metadata.xml", &metadata_xml("x86_64")),
            ("t1.xml", &testcase_xml(&["5", "7"])),
            ("t2.xml", &testcase_xml(&["0"])),
        ]);
        let suite = parse_suite(archive.path()).expect("valid suite must parse");
        assert_eq!(suite.metadata.architecture.as_deref(), Some("x86_64"));
        assert_eq!(suite.vectors.len(), 2);
        assert_eq!(suite.vectors[0].name, "t1");
        assert_eq!(suite.vectors[0].values, vec!["5", "7"]);
        assert_eq!(suite.vectors[1].name, "t2");
        assert_eq!(suite.vectors[1].values, vec!["0"]);
    }

    #[test]
    fn parse_suite_skips_malformed_entries() {
        let archive = write_archive(&[
            ("metadata.xml", &metadata_xml("x86_64")),
            ("broken.xml", "this is not a testcase"),
            ("good.xml", &testcase_xml(&["1"])),
            ("notes.txt", "ignored entirely"),
        ]);
        let suite = parse_suite(archive.path()).expect("malformed entries must not fail the suite");
        assert_eq!(suite.vectors.len(), 1);
        assert_eq!(suite.vectors[0].name, "good");
    }

    #[test]
    fn parse_suite_requires_metadata() {
        let archive = write_archive(&[("t1.xml", &testcase_xml(&["1"]))]);
        match parse_suite(archive.path()) {
            Err(SuiteError::MissingMetadata(path)) => {
                assert_eq!(path, archive.path());
            }
            other => panic!("expected MissingMetadata, got {other:?}"),
        }
    }

    #[test]
    fn stdin_payload_joins_values_with_newlines() {
        let vector = TestVector::new("t", "t.xml", vec!["5".into(), "7".into()]);
        assert_eq!(vector.stdin_payload(), "5\n7\n");

        let empty = TestVector::new("e", "e.xml", vec![]);
        assert_eq!(
            empty.stdin_payload(),
            "",
            "a zero-value vector must not feed a phantom empty line"
        );
    }
}
