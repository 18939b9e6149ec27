use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::segment::{Segment, SegmentData};
use crate::{Error, Result};

/// Source of conditioned time series
///
/// Implementors hand out segments that are already unit-converted, gap-segmented, low-pass
/// filtered and clipped to physically meaningful values. In particular every flow sample must be
/// strictly positive.
pub trait TimeSeriesProvider {
    /// # Errors
    /// Returns an error if the data set cannot be found or does not form a valid [`Segment`].
    fn segment(&self, id: &str) -> Result<Segment>;
}

/// Reads conditioned segments stored as `<root>/<id>.csv`
///
/// Files carry a header naming the columns `t, x1, u1, u2, T, F` and optionally `eta`. Sensor
/// data sets naming the outlet concentration `y1` are accepted in place of `x1`. When `eta` is
/// absent it is derived from the concentrations with the one-step delay model.
pub struct CsvProvider {
    root: PathBuf,
}

impl CsvProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Identifiers of every `csv` file under the root, sorted
    ///
    /// # Errors
    /// Returns an error if the root directory cannot be read.
    pub fn ids(&self) -> Result<Vec<String>> {
        let mut ids = fs::read_dir(&self.root)?
            .filter_map(::std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(ToOwned::to_owned)
            })
            .collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Deserialize)]
struct Row {
    t: f64,
    #[serde(alias = "y1")]
    x1: f64,
    u1: f64,
    u2: f64,
    #[serde(rename = "T")]
    temperature: f64,
    #[serde(rename = "F")]
    flow: f64,
    eta: Option<f64>,
}

const REQUIRED_COLUMNS: [&str; 5] = ["t", "u1", "u2", "T", "F"];

fn read_segment(id: &str, path: &Path) -> Result<Segment> {
    let file = fs::read(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(&file[..]);

    let headers = rdr.headers()?.clone();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|header| header == column) {
            return Err(Error::MissingColumn(column.to_owned()));
        }
    }
    if !headers.iter().any(|header| header == "x1" || header == "y1") {
        return Err(Error::MissingColumn("x1".to_owned()));
    }

    let mut data = SegmentData::default();
    let mut eta = Some(vec![]);
    for result in rdr.deserialize() {
        let row: Row = result?;
        data.t.push(row.t);
        data.x1.push(row.x1);
        data.u1.push(row.u1);
        data.u2.push(row.u2);
        data.temperature.push(row.temperature);
        data.flow.push(row.flow);
        // A single missing efficiency value means the column cannot be trusted
        eta = eta.zip(row.eta).map(|(mut eta, value)| {
            eta.push(value);
            eta
        });
    }
    data.eta = eta;

    Segment::new(id, data)
}

impl TimeSeriesProvider for CsvProvider {
    fn segment(&self, id: &str) -> Result<Segment> {
        let path = self.root.join(format!("{id}.csv"));
        if !path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no data set {id} under {}", self.root.display()),
            )));
        }
        tracing::debug!(id, path = %path.display(), "reading conditioned segment");
        read_segment(id, &path)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::{CsvProvider, TimeSeriesProvider};
    use crate::Error;

    fn write(dir: &TempDir, id: &str, contents: &str) {
        std::fs::write(dir.path().join(format!("{id}.csv")), contents).unwrap();
    }

    #[test]
    fn segments_with_efficiency_column_are_read_verbatim() {
        let dir = TempDir::new("provider_verbatim").unwrap();
        write(
            &dir,
            "rmc",
            "t,x1,u1,u2,T,F,eta\n0,1,5,1,300,2,0.5\n1,2,6,1,310,2,0.6\n2,3,7,1,320,2,0.7\n",
        );

        let segment = CsvProvider::new(dir.path()).segment("rmc").unwrap();

        assert_eq!(segment.name(), "rmc");
        assert_eq!(segment.len(), 3);
        assert_eq!(segment.eta().to_vec(), vec![0.5, 0.6, 0.7]);
        assert_eq!(segment.temperature().to_vec(), vec![300., 310., 320.]);
    }

    #[test]
    fn sensor_outlet_column_is_accepted_and_efficiency_derived() {
        let dir = TempDir::new("provider_derived").unwrap();
        write(&dir, "iod", "t,y1,u1,u2,T,F\n0,1,5,1,300,2\n1,2,6,1,310,2\n");

        let segment = CsvProvider::new(dir.path()).segment("iod").unwrap();

        assert_eq!(segment.x1().to_vec(), vec![1., 2.]);
        assert_eq!(segment.eta().to_vec(), vec![3., 3.]);
    }

    #[test]
    fn missing_columns_are_reported_by_name() {
        let dir = TempDir::new("provider_missing").unwrap();
        write(&dir, "bad", "t,x1,u1,T,F\n0,1,5,300,2\n1,2,6,310,2\n");

        let result = CsvProvider::new(dir.path()).segment("bad");
        assert!(matches!(result, Err(Error::MissingColumn(column)) if column == "u2"));
    }

    #[test]
    fn ids_list_csv_files_in_order() {
        let dir = TempDir::new("provider_ids").unwrap();
        write(&dir, "b", "t\n");
        write(&dir, "a", "t\n");
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let ids = CsvProvider::new(dir.path()).ids().unwrap();
        assert_eq!(ids, vec!["a".to_owned(), "b".to_owned()]);
    }
}
