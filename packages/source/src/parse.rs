//! Gzip CSV decoding into validated usage records.
//!
//! Two header layouts are understood:
//!
//! * **Meter readings**: `meter_id`, `reading_timestamp`, `consumption`.
//! * **Postcode annual totals**: `POSTCODE`, `Number of meters`,
//!   `Consumption (kWh)`, `Mean consumption (kWh)`,
//!   `Median consumption (kWh)`. These files carry no timestamp column;
//!   every row is stamped with 1 January of the year in the file name.
//!
//! [`RecordStream`] is a lazy iterator. Malformed rows are skipped and
//! counted. Once the file is exhausted, a final
//! [`ParseError::TooManyInvalidRows`] is yielded if the rejected share is
//! above the threshold, so a loader consuming the stream inside a
//! transaction rolls back.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone as _, Utc};
use energy_usage_models::{Commodity, UsageRecord};
use flate2::read::GzDecoder;
use rust_decimal::Decimal;

use crate::{ParseError, RowError};

/// Rejected rows kept for logging.
const MAX_SAMPLE_ERRORS: usize = 5;

/// Fractional digits a consumption value may carry. The warehouse stores
/// consumption columns as `DECIMAL(CONSUMPTION_PRECISION, CONSUMPTION_SCALE)`.
pub const CONSUMPTION_SCALE: u32 = 10;

/// Total significant digits of a stored consumption value.
pub const CONSUMPTION_PRECISION: u32 = 38;

/// Largest integer part a consumption value may have, exclusive.
const CONSUMPTION_INTEGER_DIGITS: u32 = CONSUMPTION_PRECISION - CONSUMPTION_SCALE;

/// Valid and rejected row counts for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowStats {
    /// Rows turned into records.
    pub valid: u64,
    /// Rows skipped by validation.
    pub invalid: u64,
}

impl RowStats {
    /// All data rows read so far.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.valid + self.invalid
    }

    /// Share of rejected rows, `0.0` for an empty file.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn invalid_ratio(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.invalid as f64 / self.total() as f64
        }
    }
}

#[derive(Debug, Clone)]
enum Layout {
    Reading {
        meter_id: usize,
        timestamp: usize,
        consumption: usize,
    },
    PostcodeAnnual {
        postcode: usize,
        consumption: usize,
        meters: Option<usize>,
        mean: Option<usize>,
        median: Option<usize>,
        timestamp: DateTime<Utc>,
    },
}

impl Layout {
    fn detect(headers: &csv::StringRecord, file_name: &str) -> Result<Self, ParseError> {
        let names: Vec<String> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_ascii_lowercase())
            .collect();
        let find = |wanted: &str| names.iter().position(|n| n == wanted);

        if let (Some(meter_id), Some(timestamp), Some(consumption)) = (
            find("meter_id"),
            find("reading_timestamp"),
            find("consumption").or_else(|| find("consumption_value")),
        ) {
            return Ok(Self::Reading {
                meter_id,
                timestamp,
                consumption,
            });
        }

        if let (Some(postcode), Some(consumption)) = (find("postcode"), find("consumption (kwh)")) {
            let year = year_from_file_name(file_name).ok_or_else(|| ParseError::MissingYear {
                file_name: file_name.to_owned(),
            })?;
            let timestamp = Utc
                .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
                .single()
                .ok_or_else(|| ParseError::MissingYear {
                    file_name: file_name.to_owned(),
                })?;
            return Ok(Self::PostcodeAnnual {
                postcode,
                consumption,
                meters: find("number of meters"),
                mean: find("mean consumption (kwh)"),
                median: find("median consumption (kwh)"),
                timestamp,
            });
        }

        Err(ParseError::UnknownLayout {
            headers: headers.iter().collect::<Vec<_>>().join(","),
        })
    }

    fn record(
        &self,
        row: &csv::StringRecord,
        commodity: Commodity,
        file_name: &str,
    ) -> Result<UsageRecord, String> {
        let field = |i: usize| row.get(i).map_or("", str::trim);

        match self {
            Self::Reading {
                meter_id,
                timestamp,
                consumption,
            } => {
                let meter_id = required(field(*meter_id), "meter_id")?;
                let raw_ts = field(*timestamp);
                let reading_timestamp = parse_timestamp(raw_ts)
                    .ok_or_else(|| format!("unparseable reading_timestamp {raw_ts:?}"))?;
                let consumption_value = parse_consumption(field(*consumption), "consumption")?;
                Ok(UsageRecord::reading(
                    meter_id,
                    reading_timestamp,
                    consumption_value,
                    commodity,
                    file_name,
                ))
            }
            Self::PostcodeAnnual {
                postcode,
                consumption,
                meters,
                mean,
                median,
                timestamp,
            } => {
                let postcode = required(field(*postcode), "POSTCODE")?;
                let consumption_value =
                    parse_consumption(field(*consumption), "Consumption (kWh)")?;
                let meter_count = meters
                    .map(|i| optional_count(field(i), "Number of meters"))
                    .transpose()?
                    .flatten();
                let mean_consumption = mean
                    .map(|i| optional_decimal(field(i), "Mean consumption (kWh)"))
                    .transpose()?
                    .flatten();
                let median_consumption = median
                    .map(|i| optional_decimal(field(i), "Median consumption (kWh)"))
                    .transpose()?
                    .flatten();

                Ok(UsageRecord {
                    meter_id: postcode.to_owned(),
                    reading_timestamp: *timestamp,
                    consumption_value,
                    commodity,
                    source_file_name: file_name.to_owned(),
                    meter_count,
                    mean_consumption,
                    median_consumption,
                })
            }
        }
    }
}

/// Lazy, finite stream of validated records from one file.
///
/// Yields `Ok` for each valid row. Yields at most one `Err`, after which
/// it returns `None`: either a fatal read error or, at the end of the
/// file, [`ParseError::TooManyInvalidRows`].
pub struct RecordStream {
    rows: csv::StringRecordsIntoIter<Box<dyn Read + Send>>,
    layout: Layout,
    commodity: Commodity,
    file_name: String,
    threshold: f64,
    stats: RowStats,
    samples: Vec<RowError>,
    finished: bool,
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("file_name", &self.file_name)
            .field("commodity", &self.commodity)
            .field("layout", &self.layout)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl RecordStream {
    /// Opens a gzip-compressed CSV file and validates its header row.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if the file cannot be opened or decompressed,
    /// the header matches no known layout, or a postcode annual file has
    /// no year in its name.
    pub fn open(
        path: &Path,
        commodity: Commodity,
        file_name: &str,
        row_error_threshold: f64,
    ) -> Result<Self, ParseError> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        Self::from_reader(Box::new(decoder), commodity, file_name, row_error_threshold)
    }

    /// Builds a stream over already-decompressed CSV text.
    ///
    /// # Errors
    ///
    /// See [`RecordStream::open`].
    pub fn from_reader(
        reader: Box<dyn Read + Send>,
        commodity: Commodity,
        file_name: &str,
        row_error_threshold: f64,
    ) -> Result<Self, ParseError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        let headers = csv_reader.headers().map_err(csv_error)?.clone();
        let layout = Layout::detect(&headers, file_name)?;

        log::debug!("{file_name}: detected {layout:?}");

        Ok(Self {
            rows: csv_reader.into_records(),
            layout,
            commodity,
            file_name: file_name.to_owned(),
            threshold: row_error_threshold,
            stats: RowStats::default(),
            samples: Vec::new(),
            finished: false,
        })
    }

    /// Counts so far. Final once the stream returned `None`.
    #[must_use]
    pub const fn stats(&self) -> RowStats {
        self.stats
    }

    /// The first few rejected rows.
    #[must_use]
    pub fn sample_errors(&self) -> &[RowError] {
        &self.samples
    }

    fn reject(&mut self, error: RowError) {
        self.stats.invalid += 1;
        log::debug!("{}: rejected {error}", self.file_name);
        if self.samples.len() < MAX_SAMPLE_ERRORS {
            self.samples.push(error);
        }
    }

    fn finish(&mut self) -> Option<ParseError> {
        self.finished = true;
        if self.stats.invalid == 0 {
            return None;
        }

        log::warn!(
            "{}: skipped {} of {} rows ({:.2}%), first errors: {}",
            self.file_name,
            self.stats.invalid,
            self.stats.total(),
            self.stats.invalid_ratio() * 100.0,
            self.samples
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        );

        (self.stats.invalid_ratio() > self.threshold).then(|| ParseError::TooManyInvalidRows {
            invalid: self.stats.invalid,
            total: self.stats.total(),
            threshold: self.threshold,
        })
    }
}

impl Iterator for RecordStream {
    type Item = Result<UsageRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            match self.rows.next() {
                Some(Ok(row)) => {
                    let line = row.position().map_or(0, csv::Position::line);
                    match self.layout.record(&row, self.commodity, &self.file_name) {
                        Ok(record) => {
                            self.stats.valid += 1;
                            return Some(Ok(record));
                        }
                        Err(reason) => self.reject(RowError { line, reason }),
                    }
                }
                Some(Err(e)) if e.is_io_error() => {
                    self.finished = true;
                    return Some(Err(csv_error(e)));
                }
                Some(Err(e)) => {
                    let line = e.position().map_or(0, csv::Position::line);
                    self.reject(RowError {
                        line,
                        reason: e.to_string(),
                    });
                }
                None => return self.finish().map(Err),
            }
        }
    }
}

fn csv_error(e: csv::Error) -> ParseError {
    if e.is_io_error() {
        ParseError::Io(e.into())
    } else {
        ParseError::Csv(e)
    }
}

fn required<'a>(value: &'a str, column: &str) -> Result<&'a str, String> {
    if value.is_empty() {
        Err(format!("empty {column}"))
    } else {
        Ok(value)
    }
}

fn parse_decimal(value: &str) -> Option<Decimal> {
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .ok()
}

fn parse_consumption(value: &str, column: &str) -> Result<Decimal, String> {
    let parsed = parse_decimal(value).ok_or_else(|| format!("unparseable {column} {value:?}"))?;
    if parsed.is_sign_negative() && !parsed.is_zero() {
        return Err(format!("negative {column} {value:?}"));
    }
    let parsed = parsed.normalize();
    if parsed.scale() > CONSUMPTION_SCALE {
        return Err(format!(
            "{column} {value:?} has more than {CONSUMPTION_SCALE} decimal places"
        ));
    }
    if parsed.trunc().to_string().trim_start_matches('-').len()
        > CONSUMPTION_INTEGER_DIGITS as usize
    {
        return Err(format!(
            "{column} {value:?} has more than {CONSUMPTION_INTEGER_DIGITS} integer digits"
        ));
    }
    Ok(parsed)
}

fn optional_decimal(value: &str, column: &str) -> Result<Option<Decimal>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    parse_consumption(value, column).map(Some)
}

fn optional_count(value: &str, column: &str) -> Result<Option<u32>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|_| format!("unparseable {column} {value:?}"))
}

/// Parses a reading timestamp. Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`,
/// `YYYY-MM-DDTHH:MM:SS` (both with optional fractional seconds, taken as
/// UTC), and a bare `YYYY-MM-DD` (midnight UTC).
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Extracts the data year from a file name such as `Gas2019.csv.gz` or
/// `electricity_2020.csv`.
///
/// The name is lower-cased, `.gz` and the remaining extension are dropped,
/// the commodity word is removed, and what is left must be a four-digit
/// year.
#[must_use]
pub fn year_from_file_name(file_name: &str) -> Option<i32> {
    let lower = file_name.to_ascii_lowercase().replace(".gz", "");
    let stem = Path::new(&lower).file_stem()?.to_str()?;
    let remainder = stem.replace("electricity", "").replace("gas", "");
    let digits = remainder.trim_matches(|c: char| !c.is_ascii_digit());

    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::PathBuf;
    use std::str::FromStr as _;

    use chrono::{Datelike as _, TimeZone as _};
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn gz_fixture(dir: &str, name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("energy_usage_parse_test-{}", std::process::id()))
            .join(dir);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(contents.as_bytes()).unwrap();
        encoder.finish().unwrap();
        path
    }

    fn readings(rows: &[&str]) -> String {
        let mut csv = String::from("meter_id,reading_timestamp,consumption\n");
        for row in rows {
            csv.push_str(row);
            csv.push('\n');
        }
        csv
    }

    #[test]
    fn reads_meter_reading_layout() {
        let path = gz_fixture(
            "readings",
            "Electricity2020.csv.gz",
            &readings(&[
                "M1,2020-01-01T00:30:00Z,1.25",
                "M2,2020-01-01 00:30:00,0",
                "M3,2020-01-02,3",
            ]),
        );

        let mut stream =
            RecordStream::open(&path, Commodity::Electricity, "Electricity2020.csv.gz", 0.05)
                .unwrap();
        let records: Vec<UsageRecord> = stream.by_ref().map(Result::unwrap).collect();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].meter_id, "M1");
        assert_eq!(records[0].consumption_value, Decimal::new(125, 2));
        assert_eq!(records[0].commodity, Commodity::Electricity);
        assert_eq!(records[0].source_file_name, "Electricity2020.csv.gz");
        assert_eq!(records[2].reading_timestamp.day(), 2);
        assert_eq!(stream.stats(), RowStats { valid: 3, invalid: 0 });
    }

    #[test]
    fn skips_malformed_row_under_threshold() {
        let mut rows: Vec<String> = (0..30)
            .map(|i| format!("M{i},2020-01-01T00:00:00Z,{i}"))
            .collect();
        rows.insert(10, "M-bad,not a date,1".to_owned());
        let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
        let path = gz_fixture("under", "Gas2020.csv.gz", &readings(&rows));

        let mut stream = RecordStream::open(&path, Commodity::Gas, "Gas2020.csv.gz", 0.05).unwrap();
        let results: Vec<_> = stream.by_ref().collect();

        assert_eq!(results.len(), 30);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(stream.stats(), RowStats { valid: 30, invalid: 1 });
        assert_eq!(stream.sample_errors().len(), 1);
        assert_eq!(stream.sample_errors()[0].line, 12);
    }

    #[test]
    fn too_many_invalid_rows_ends_with_error() {
        let path = gz_fixture(
            "over",
            "Gas2020.csv.gz",
            &readings(&["M1,2020-01-01,1", "M2,2020-01-01,-4", ",2020-01-01,2"]),
        );

        let stream = RecordStream::open(&path, Commodity::Gas, "Gas2020.csv.gz", 0.05).unwrap();
        let results: Vec<_> = stream.collect();

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(ParseError::TooManyInvalidRows {
                invalid: 2,
                total: 3,
                ..
            })
        ));
    }

    #[test]
    fn reads_postcode_annual_layout() {
        let csv = "POSTCODE,Number of meters,Consumption (kWh),Mean consumption (kWh),Median consumption (kWh)\n\
                   AB1 0AA,12,45000.5,3750.04,3600\n\
                   AB1 0AB,3,9000,3000,\n";
        let path = gz_fixture("postcode", "Gas2019.csv.gz", csv);

        let records: Vec<UsageRecord> =
            RecordStream::open(&path, Commodity::Gas, "Gas2019.csv.gz", 0.05)
                .unwrap()
                .map(Result::unwrap)
                .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].meter_id, "AB1 0AA");
        assert_eq!(
            records[0].reading_timestamp,
            Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(records[0].meter_count, Some(12));
        assert_eq!(records[0].mean_consumption, Some(Decimal::new(375_004, 2)));
        assert_eq!(records[1].median_consumption, None);
    }

    #[test]
    fn postcode_layout_needs_year_in_file_name() {
        let csv = "POSTCODE,Consumption (kWh)\nAB1 0AA,1\n";
        let path = gz_fixture("noyear", "gas_latest.csv.gz", csv);

        let err = RecordStream::open(&path, Commodity::Gas, "gas_latest.csv.gz", 0.05).unwrap_err();
        assert!(matches!(err, ParseError::MissingYear { .. }));
    }

    #[test]
    fn unknown_header_is_rejected() {
        let path = gz_fixture("unknown", "Gas2019.csv.gz", "a,b,c\n1,2,3\n");
        let err = RecordStream::open(&path, Commodity::Gas, "Gas2019.csv.gz", 0.05).unwrap_err();
        assert!(matches!(err, ParseError::UnknownLayout { .. }));
    }

    #[test]
    fn non_gzip_file_is_an_io_error() {
        let dir = std::env::temp_dir()
            .join(format!("energy_usage_parse_test-{}", std::process::id()))
            .join("plain");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("Gas2019.csv.gz");
        std::fs::write(&path, "meter_id,reading_timestamp,consumption\n").unwrap();

        let err = RecordStream::open(&path, Commodity::Gas, "Gas2019.csv.gz", 0.05).unwrap_err();
        assert!(matches!(err, ParseError::Io(_)));
    }

    #[test]
    fn timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2020, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(parse_timestamp("2020-03-04T05:06:07Z"), Some(expected));
        assert_eq!(parse_timestamp("2020-03-04T06:06:07+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2020-03-04 05:06:07"), Some(expected));
        assert_eq!(parse_timestamp("2020-03-04T05:06:07"), Some(expected));
        assert_eq!(
            parse_timestamp("2020-03-04"),
            Some(Utc.with_ymd_and_hms(2020, 3, 4, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("04/03/2020"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn year_from_names() {
        assert_eq!(year_from_file_name("Gas2019.csv.gz"), Some(2019));
        assert_eq!(year_from_file_name("Electricity2020.csv"), Some(2020));
        assert_eq!(year_from_file_name("ELECTRICITY_2021.CSV.GZ"), Some(2021));
        assert_eq!(year_from_file_name("gas.csv.gz"), None);
        assert_eq!(year_from_file_name("gas20190.csv.gz"), None);
    }

    #[test]
    fn consumption_must_fit_the_stored_decimal() {
        assert_eq!(
            parse_consumption("0.00004", "consumption"),
            Ok(Decimal::new(4, 5))
        );
        assert_eq!(
            parse_consumption("1.50000000000000", "consumption"),
            Ok(Decimal::new(15, 1))
        );
        assert_eq!(
            parse_consumption("1e20", "consumption"),
            Ok(Decimal::from_str("100000000000000000000").unwrap())
        );
        assert!(parse_consumption("0.000000000001", "consumption").is_err());
        assert!(parse_consumption("12345678901234567890123456789", "consumption").is_err());
    }

    #[test]
    fn oversized_consumption_is_a_row_error() {
        let mut rows: Vec<String> = (0..99)
            .map(|i| format!("M{i},2020-01-01T00:00:00Z,1.5"))
            .collect();
        rows.push("M-huge,2020-01-01T00:00:00Z,12345678901234567890123456789".to_owned());
        let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
        let path = gz_fixture("oversized", "Gas2020.csv.gz", &readings(&rows));

        let mut stream = RecordStream::open(&path, Commodity::Gas, "Gas2020.csv.gz", 0.05).unwrap();
        let results: Vec<_> = stream.by_ref().collect();

        assert_eq!(results.len(), 99);
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(stream.stats(), RowStats { valid: 99, invalid: 1 });
        assert!(stream.sample_errors()[0].reason.contains("integer digits"));
    }
}
