use std::num::ParseIntError;

#[derive(Debug, thiserror::Error)]
pub enum CpuListError {
    #[error("empty cpu list")]
    Empty,
    #[error("invalid cpu number `{value}`: {source}")]
    InvalidCpu {
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("invalid cpu range `{0}`")]
    InvalidRange(String),
}

/// Counts the cpus named by a cpuset list such as the contents of
/// `cpuset.effective_cpus` or the runtime's `CpusetCpus` field.
///
/// The list format is comma-separated entries, each a single cpu number
/// (`5`) or an inclusive range (`0-3`). A malformed list yields an
/// error rather than a partial count.
pub fn count_cpu_list(list: &str) -> Result<u32, CpuListError> {
    let list = list.trim();
    if list.is_empty() {
        return Err(CpuListError::Empty);
    }

    let mut count = 0u32;
    for entry in list.split(',') {
        let entry = entry.trim();
        match entry.split_once('-') {
            Some((start, end)) => {
                let start = parse_cpu(start)?;
                let end = parse_cpu(end)?;
                if end < start {
                    return Err(CpuListError::InvalidRange(entry.to_owned()));
                }
                count += end - start + 1;
            }
            None => {
                parse_cpu(entry)?;
                count += 1;
            }
        }
    }

    Ok(count)
}

fn parse_cpu(value: &str) -> Result<u32, CpuListError> {
    value.parse::<u32>().map_err(|source| CpuListError::InvalidCpu {
        value: value.to_owned(),
        source,
    })
}
