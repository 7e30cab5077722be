use crate::test_list::DeviceType;
use std::path::PathBuf;

/// Layout of everything a run writes.
///
/// ```text
/// <root>/<stem>.log                          aggregate results log
/// <root>/<stem>.json                         run report
/// <root>/captures/<device>/<NNN>-<test>.log  kept capture files
/// ```
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
    stem: String,
}

impl OutputDir {
    /// `log_file_name` is the full log file name, e.g. `results_2026-10-16_14-03.log`.
    pub fn new(root: impl Into<PathBuf>, log_file_name: &str) -> Self {
        let stem = log_file_name
            .strip_suffix(".log")
            .unwrap_or(log_file_name)
            .to_string();
        Self {
            root: root.into(),
            stem,
        }
    }

    pub fn log(&self) -> PathBuf {
        self.root.join(format!("{}.log", self.stem))
    }

    pub fn report(&self) -> PathBuf {
        self.root.join(format!("{}.json", self.stem))
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.root.join("captures")
    }

    /// Path for a kept capture file, e.g. `captures/CL_DEVICE_TYPE_GPU/003-Images.shard2.log`.
    ///
    /// `index` is the test's 1-based position in the device's run; it keeps
    /// names that sanitize to the same string apart.
    pub fn capture_file(
        &self,
        device: DeviceType,
        index: usize,
        test_name: &str,
        shard: Option<u32>,
    ) -> PathBuf {
        let name = sanitize(test_name);
        let file = match shard {
            Some(k) => format!("{index:03}-{name}.shard{k}.log"),
            None => format!("{index:03}-{name}.log"),
        };
        self.captures_dir().join(device.as_str()).join(file)
    }

    /// Create the root directory if missing.
    pub fn init(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}

/// Make a test name usable as a single path component.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "unnamed".to_string(),
        s => s.to_string(),
    }
}
