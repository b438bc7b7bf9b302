use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use csv::StringRecord;
use tracing::info;

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::trace::{DurationStats, Function, JobSeries, MemoryStats, Trace};

/// Load and join the trace directory into the immutable function set.
///
/// Join key is `HashFunction`; a row of invocations.csv without a matching
/// durations/memory row is a trace error, as is any negative invocation
/// count. In scheduler mode the iterations/batch/deadline series are joined
/// the same way.
pub fn load(cfg: &RunConfig) -> Result<Trace> {
    let inv_rows = parse_invocations(&cfg.trace_path.join("invocations.csv"))?;
    let durations = parse_durations(&cfg.trace_path.join("durations.csv"))?;
    let memory = parse_memory(&cfg.trace_path.join("memory.csv"))?;

    let job_series = if cfg.scheduler_mode() {
        Some((
            parse_minute_series(&cfg.trace_path.join("iterations.csv"))?,
            parse_minute_series(&cfg.trace_path.join("batch.csv"))?,
            parse_minute_series(&cfg.trace_path.join("deadline.csv"))?,
        ))
    } else {
        None
    };

    let mut functions = Vec::with_capacity(inv_rows.len());
    for (idx, row) in inv_rows.into_iter().enumerate() {
        let duration = durations.get(&row.hash).cloned().ok_or_else(|| {
            Error::Trace(format!("durations.csv has no row for hash {}", row.hash))
        })?;
        let mem = memory
            .get(&row.hash)
            .cloned()
            .ok_or_else(|| Error::Trace(format!("memory.csv has no row for hash {}", row.hash)))?;

        let jobs = match &job_series {
            Some((iters, batches, deadlines)) => Some(JobSeries {
                iterations: series_for(iters, &row.hash, "iterations.csv")?,
                batchsize: series_for(batches, &row.hash, "batch.csv")?,
                deadline_ms: series_for(deadlines, &row.hash, "deadline.csv")?,
            }),
            None => None,
        };

        let name = function_name(idx, &row.hash);
        let endpoint = format!("http://{name}.{}:{}", cfg.gateway, cfg.function_port);
        functions.push(Arc::new(Function {
            name,
            hash: row.hash,
            endpoint,
            ipm: row.ipm,
            warmup_ipm: row.warmup_ipm,
            duration,
            memory: mem,
            jobs,
        }));
    }

    if functions.is_empty() {
        return Err(Error::Trace("invocations.csv contains no functions".into()));
    }

    info!(functions = functions.len(), "Trace loaded");
    Ok(Trace { functions })
}

/// The cluster-visible function name: stable per trace position, readable,
/// and still unique thanks to the hash prefix.
fn function_name(idx: usize, hash: &str) -> String {
    let prefix: String = hash.chars().take(8).collect();
    format!("trace-func-{idx}-{prefix}")
}

struct InvocationRow {
    hash: String,
    warmup_ipm: Vec<u32>,
    ipm: Vec<u32>,
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>> {
    csv::Reader::from_path(path)
        .map_err(|e| Error::Trace(format!("cannot open {}: {e}", path.display())))
}

fn malformed(path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Trace(format!("{}: {e}", path.display()))
}

/// Index of header label to column position. The name column is either
/// `FunctionName` or `HashFunction`, whichever the preprocessor emitted.
fn header_index(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_string(), i))
        .collect()
}

fn name_column(index: &HashMap<String, usize>, path: &Path) -> Result<usize> {
    index
        .get("FunctionName")
        .or_else(|| index.get("HashFunction"))
        .copied()
        .ok_or_else(|| malformed(path, "missing FunctionName/HashFunction column"))
}

/// Minute columns are headers that parse as integers. Negative labels are
/// warm-up ramp minutes and are returned separately, both in chronological
/// order.
fn minute_columns(index: &HashMap<String, usize>) -> (Vec<(i64, usize)>, Vec<(i64, usize)>) {
    let mut warmup = Vec::new();
    let mut measured = Vec::new();
    for (label, &col) in index {
        if let Ok(minute) = label.parse::<i64>() {
            if minute < 0 {
                warmup.push((minute, col));
            } else {
                measured.push((minute, col));
            }
        }
    }
    warmup.sort_unstable();
    measured.sort_unstable();
    (warmup, measured)
}

fn parse_invocations(path: &Path) -> Result<Vec<InvocationRow>> {
    let mut reader = open(path)?;
    let headers = reader
        .headers()
        .map_err(|e| malformed(path, e))?
        .clone();
    let index = header_index(&headers);
    let name_col = name_column(&index, path)?;
    let (warmup_cols, measured_cols) = minute_columns(&index);
    if measured_cols.is_empty() {
        return Err(malformed(path, "no minute columns"));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| malformed(path, e))?;
        let hash = field(&record, name_col, path)?.to_string();

        let counts = |cols: &[(i64, usize)]| -> Result<Vec<u32>> {
            cols.iter()
                .map(|&(minute, col)| {
                    let raw = field(&record, col, path)?;
                    let value: i64 = raw
                        .trim()
                        .parse()
                        .map_err(|_| malformed(path, format!("bad count {raw:?} for {hash}")))?;
                    if value < 0 {
                        return Err(Error::Trace(format!(
                            "{}: negative invocation count {value} for {hash} at minute {minute}",
                            path.display()
                        )));
                    }
                    Ok(value as u32)
                })
                .collect()
        };

        rows.push(InvocationRow {
            warmup_ipm: counts(&warmup_cols)?,
            ipm: counts(&measured_cols)?,
            hash,
        });
    }
    Ok(rows)
}

fn field<'r>(record: &'r StringRecord, col: usize, path: &Path) -> Result<&'r str> {
    record
        .get(col)
        .ok_or_else(|| malformed(path, format!("short row (missing column {col})")))
}

fn numeric(index: &HashMap<String, usize>, record: &StringRecord, label: &str, path: &Path) -> Result<f64> {
    let col = *index
        .get(label)
        .ok_or_else(|| malformed(path, format!("missing column {label}")))?;
    let raw = field(record, col, path)?;
    raw.trim()
        .parse()
        .map_err(|_| malformed(path, format!("bad value {raw:?} in column {label}")))
}

fn parse_durations(path: &Path) -> Result<HashMap<String, DurationStats>> {
    let mut reader = open(path)?;
    let headers = reader
        .headers()
        .map_err(|e| malformed(path, e))?
        .clone();
    let index = header_index(&headers);
    let name_col = name_column(&index, path)?;

    let mut stats = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| malformed(path, e))?;
        let hash = field(&record, name_col, path)?.to_string();
        let mut percentiles = [0.0; 7];
        for (slot, pct) in [0, 1, 25, 50, 75, 99, 100].into_iter().enumerate() {
            percentiles[slot] =
                numeric(&index, &record, &format!("percentile_Average_{pct}"), path)?;
        }
        stats.insert(
            hash,
            DurationStats {
                average: numeric(&index, &record, "Average", path)?,
                count: numeric(&index, &record, "Count", path)?,
                minimum: numeric(&index, &record, "Minimum", path)?,
                maximum: numeric(&index, &record, "Maximum", path)?,
                percentiles,
            },
        );
    }
    Ok(stats)
}

fn parse_memory(path: &Path) -> Result<HashMap<String, MemoryStats>> {
    let mut reader = open(path)?;
    let headers = reader
        .headers()
        .map_err(|e| malformed(path, e))?
        .clone();
    let index = header_index(&headers);
    let name_col = name_column(&index, path)?;

    let mut stats = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| malformed(path, e))?;
        let hash = field(&record, name_col, path)?.to_string();
        let mut percentiles = [0.0; 8];
        for (slot, pct) in [1, 5, 25, 50, 75, 95, 99, 100].into_iter().enumerate() {
            percentiles[slot] =
                numeric(&index, &record, &format!("AverageAllocatedMb_pct{pct}"), path)?;
        }
        stats.insert(
            hash,
            MemoryStats {
                sample_count: numeric(&index, &record, "SampleCount", path)?,
                average: numeric(&index, &record, "AverageAllocatedMb", path)?,
                percentiles,
            },
        );
    }
    Ok(stats)
}

/// Parse a per-minute integer series file (iterations/batch/deadline.csv).
/// Same row schema as invocations.csv; warm-up columns are not meaningful for
/// job parameters and are ignored.
fn parse_minute_series(path: &Path) -> Result<HashMap<String, Vec<i64>>> {
    let mut reader = open(path)?;
    let headers = reader
        .headers()
        .map_err(|e| malformed(path, e))?
        .clone();
    let index = header_index(&headers);
    let name_col = name_column(&index, path)?;
    let (_, measured_cols) = minute_columns(&index);
    if measured_cols.is_empty() {
        return Err(malformed(path, "no minute columns"));
    }

    let mut series = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| malformed(path, e))?;
        let hash = field(&record, name_col, path)?.to_string();
        let values = measured_cols
            .iter()
            .map(|&(_, col)| {
                let raw = field(&record, col, path)?;
                raw.trim()
                    .parse()
                    .map_err(|_| malformed(path, format!("bad value {raw:?} for {hash}")))
            })
            .collect::<Result<Vec<i64>>>()?;
        series.insert(hash, values);
    }
    Ok(series)
}

fn series_for(map: &HashMap<String, Vec<i64>>, hash: &str, file: &str) -> Result<Vec<i64>> {
    map.get(hash)
        .cloned()
        .ok_or_else(|| Error::Trace(format!("{file} has no row for hash {hash}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::base_config;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    const DUR_HEADER: &str = "HashOwner,HashApp,HashFunction,Average,Count,Minimum,Maximum,\
percentile_Average_0,percentile_Average_1,percentile_Average_25,percentile_Average_50,\
percentile_Average_75,percentile_Average_99,percentile_Average_100";

    const MEM_HEADER: &str = "HashOwner,HashApp,HashFunction,SampleCount,AverageAllocatedMb,\
AverageAllocatedMb_pct1,AverageAllocatedMb_pct5,AverageAllocatedMb_pct25,\
AverageAllocatedMb_pct50,AverageAllocatedMb_pct75,AverageAllocatedMb_pct95,\
AverageAllocatedMb_pct99,AverageAllocatedMb_pct100";

    fn write_minimal_trace(dir: &Path) {
        write_file(
            dir,
            "invocations.csv",
            "HashOwner,HashApp,HashFunction,Trigger,1,2\nown,app,abcdef0123456789,http,5,7\n",
        );
        write_file(
            dir,
            "durations.csv",
            &format!("{DUR_HEADER}\nown,app,abcdef0123456789,100,10,1,500,1,2,50,100,150,400,500\n"),
        );
        write_file(
            dir,
            "memory.csv",
            &format!("{MEM_HEADER}\nown,app,abcdef0123456789,10,128,16,32,64,128,192,224,250,256\n"),
        );
    }

    #[test]
    fn loads_and_joins_minimal_trace() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_trace(dir.path());

        let trace = load(&base_config(dir.path())).unwrap();
        assert_eq!(trace.functions.len(), 1);

        let f = &trace.functions[0];
        assert_eq!(f.hash, "abcdef0123456789");
        assert_eq!(f.name, "trace-func-0-abcdef01");
        assert_eq!(f.ipm, vec![5, 7]);
        assert!(f.warmup_ipm.is_empty());
        assert_eq!(f.duration.average, 100.0);
        assert_eq!(f.duration.percentiles[2], 50.0);
        assert_eq!(f.memory.percentiles[7], 256.0);
        assert!(f.jobs.is_none());
        assert!(f.endpoint.starts_with("http://trace-func-0-abcdef01."));
    }

    #[test]
    fn negative_minute_columns_become_warmup_series() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "invocations.csv",
            "HashFunction,-2,-1,1,2\nhash000011112222,30,60,90,90\n",
        );
        write_file(
            dir.path(),
            "durations.csv",
            &format!("{DUR_HEADER}\no,a,hash000011112222,100,1,1,100,1,1,1,1,1,1,100\n"),
        );
        write_file(
            dir.path(),
            "memory.csv",
            &format!("{MEM_HEADER}\no,a,hash000011112222,1,128,1,1,1,1,1,1,1,128\n"),
        );

        let trace = load(&base_config(dir.path())).unwrap();
        let f = &trace.functions[0];
        assert_eq!(f.warmup_ipm, vec![30, 60]);
        assert_eq!(f.ipm, vec![90, 90]);
    }

    #[test]
    fn negative_count_is_a_trace_error() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_trace(dir.path());
        write_file(
            dir.path(),
            "invocations.csv",
            "HashFunction,1\nabcdef0123456789,-3\n",
        );

        let err = load(&base_config(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Trace(_)), "got {err:?}");
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn missing_join_row_is_a_trace_error() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_trace(dir.path());
        write_file(
            dir.path(),
            "invocations.csv",
            "HashFunction,1\nabcdef0123456789,1\nunmatched_hash00,2\n",
        );

        let err = load(&base_config(dir.path())).unwrap_err();
        assert!(err.to_string().contains("unmatched_hash00"));
    }

    #[test]
    fn malformed_csv_is_a_trace_error() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_trace(dir.path());
        write_file(
            dir.path(),
            "durations.csv",
            "HashFunction,Average\nabcdef0123456789,not-a-number\n",
        );

        assert!(matches!(
            load(&base_config(dir.path())),
            Err(Error::Trace(_))
        ));
    }

    #[test]
    fn scheduler_mode_joins_job_series() {
        use crate::config::{RunConfig, SchedAlg};

        let dir = tempfile::tempdir().unwrap();
        write_minimal_trace(dir.path());
        write_file(
            dir.path(),
            "iterations.csv",
            "HashFunction,1,2\nabcdef0123456789,10,0\n",
        );
        write_file(
            dir.path(),
            "batch.csv",
            "HashFunction,1,2\nabcdef0123456789,64,64\n",
        );
        write_file(
            dir.path(),
            "deadline.csv",
            "HashFunction,1,2\nabcdef0123456789,5000,5000\n",
        );

        let cfg = RunConfig {
            sched_alg: SchedAlg::ElasticFlow,
            total_gpu: 8,
            ..base_config(dir.path())
        };
        let trace = load(&cfg).unwrap();
        let jobs = trace.functions[0].jobs.as_ref().unwrap();
        assert_eq!(jobs.iterations, vec![10, 0]);
        assert_eq!(jobs.batchsize, vec![64, 64]);
        assert_eq!(jobs.deadline_ms, vec![5000, 5000]);
        assert!(jobs.active(0));
        assert!(!jobs.active(1));
    }
}
