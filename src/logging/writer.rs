/**
 * This file is part of devsandbox-proxy.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

struct CurrentSegment {
    file: TokioFile,
    path: PathBuf,
    written: u64,
}

/// An append-only log writer that names its active segment
/// `<prefix>_<YYYYMMDD>_<NNNN><suffix>`, rotates once the segment reaches
/// `max_segment_bytes`, compresses the rotated-out segment to
/// `<same>.gz` on a background task, and prunes the oldest segments
/// (active or archived) beyond `max_files`.
pub struct RotatingLogWriter {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    max_segment_bytes: u64,
    max_files: usize,
    current: Mutex<CurrentSegment>,
}

impl RotatingLogWriter {
    pub async fn open(
        dir: &Path,
        prefix: &str,
        suffix: &str,
        max_segment_bytes: u64,
        max_files: usize,
    ) -> Result<RotatingLogWriter, std::io::Error> {
        tokio::fs::create_dir_all(dir).await?;

        let today = today_stamp();
        let existing = highest_index_for_date(dir, prefix, suffix, &today)?;

        let (path, reuse) = match existing {
            Some((path, size)) if size < max_segment_bytes => (path, true),
            Some((_, _)) => (
                segment_path(dir, prefix, suffix, &today, next_index(dir, prefix, suffix, &today)?),
                false,
            ),
            None => (segment_path(dir, prefix, suffix, &today, 1), false),
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let written = if reuse { file.metadata().await?.len() } else { 0 };

        Ok(RotatingLogWriter {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            max_segment_bytes,
            max_files,
            current: Mutex::new(CurrentSegment { file, path, written }),
        })
    }

    /// Convenience constructor for callers that don't care about the
    /// segment naming scheme (e.g. ad-hoc fanout writers in tests).
    pub async fn open_default(dir: &Path, max_segment_bytes: u64, max_files: usize) -> Result<RotatingLogWriter, std::io::Error> {
        Self::open(dir, "segment", ".log", max_segment_bytes, max_files).await
    }

    /// Append one line (a newline is added) to the active segment,
    /// rotating first if the write would cross the size threshold.
    pub async fn append_line(&self, line: &str) -> Result<(), std::io::Error> {
        let mut buf = line.as_bytes().to_vec();
        buf.push(b'\n');

        let mut current = self.current.lock().await;
        if current.written + buf.len() as u64 > self.max_segment_bytes && current.written > 0 {
            self.rotate(&mut current).await?;
        }

        current.file.write_all(&buf).await?;
        current.file.flush().await?;
        current.written += buf.len() as u64;
        Ok(())
    }

    async fn rotate(&self, current: &mut CurrentSegment) -> Result<(), std::io::Error> {
        current.file.flush().await?;

        let today = today_stamp();
        let rotated_path = current.path.clone();
        let next = next_index(&self.dir, &self.prefix, &self.suffix, &today)?;
        let new_path = segment_path(&self.dir, &self.prefix, &self.suffix, &today, next);

        let new_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&new_path)
            .await?;
        current.file = new_file;
        current.path = new_path;
        current.written = 0;

        let dir = self.dir.clone();
        let prefix = self.prefix.clone();
        let suffix = self.suffix.clone();
        let max_files = self.max_files;
        tokio::task::spawn_blocking(move || compress_and_prune(&dir, &prefix, &suffix, &rotated_path, max_files));

        Ok(())
    }
}

fn today_stamp() -> String {
    chrono::Utc::now().format("%Y%m%d").to_string()
}

/// `<prefix>_<date>_<NNNN><suffix>`, zero-padded to 4 digits.
fn segment_path(dir: &Path, prefix: &str, suffix: &str, date: &str, index: u32) -> PathBuf {
    dir.join(format!("{prefix}_{date}_{index:04}{suffix}"))
}

/// Find today's highest-indexed *active* (uncompressed) segment, returning
/// its path and current size, if any exist.
fn highest_index_for_date(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    date: &str,
) -> Result<Option<(PathBuf, u64)>, std::io::Error> {
    let needle_prefix = format!("{prefix}_{date}_");
    let mut best: Option<(u32, PathBuf, u64)> = None;

    if !dir.exists() {
        return Ok(None);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&needle_prefix) || !name.ends_with(suffix) {
            continue;
        }
        let index_part = &name[needle_prefix.len()..name.len() - suffix.len()];
        let Ok(index) = index_part.parse::<u32>() else { continue };
        let size = entry.metadata()?.len();
        if best.as_ref().map(|(i, _, _)| index > *i).unwrap_or(true) {
            best = Some((index, entry.path(), size));
        }
    }

    Ok(best.map(|(_, path, size)| (path, size)))
}

/// Count all of today's segments (active and archived-with-`.gz`) to pick
/// the next free index.
fn next_index(dir: &Path, prefix: &str, suffix: &str, date: &str) -> Result<u32, std::io::Error> {
    let needle_prefix = format!("{prefix}_{date}_");
    let mut count = 0u32;
    if !dir.exists() {
        return Ok(1);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else { continue };
        if name.starts_with(&needle_prefix) && (name.ends_with(suffix) || name.ends_with(&format!("{suffix}.gz"))) {
            count += 1;
        }
    }
    Ok(count + 1)
}

fn compress_and_prune(dir: &Path, prefix: &str, suffix: &str, rotated_path: &Path, max_files: usize) {
    if let Err(err) = compress_segment(rotated_path, suffix) {
        tracing::warn!(path = ?rotated_path, error = %err, "failed to compress rotated log segment");
    }
    if let Err(err) = prune_old_segments(dir, prefix, suffix, max_files) {
        tracing::warn!(dir = ?dir, error = %err, "failed to prune old log segments");
    }
}

fn compress_segment(path: &Path, suffix: &str) -> Result<(), std::io::Error> {
    let data = fs::read(path)?;
    let gz_path = PathBuf::from(format!("{}{}.gz", path.to_string_lossy().trim_end_matches(suffix), suffix));
    let result = (|| -> Result<(), std::io::Error> {
        let gz_file = fs::File::create(&gz_path)?;
        let mut encoder = flate2::write::GzEncoder::new(gz_file, flate2::Compression::default());
        encoder.write_all(&data)?;
        encoder.finish()?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            fs::remove_file(path)?;
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&gz_path);
            Err(err)
        }
    }
}

fn prune_old_segments(dir: &Path, prefix: &str, suffix: &str, max_files: usize) -> Result<(), std::io::Error> {
    let gz_suffix = format!("{suffix}.gz");
    let mut segments: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            if name.starts_with(&format!("{prefix}_")) && (name.ends_with(suffix) || name.ends_with(&gz_suffix)) {
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, entry.path()))
            } else {
                None
            }
        })
        .collect();

    segments.sort_by_key(|(modified, _)| *modified);

    while segments.len() > max_files {
        let (_, oldest) = segments.remove(0);
        fs::remove_file(&oldest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn appends_lines_to_the_active_segment() {
        let dir = tempdir().unwrap();
        let writer = RotatingLogWriter::open(dir.path(), "requests", ".jsonl", 1024 * 1024, 5)
            .await
            .unwrap();
        writer.append_line("line one").await.unwrap();
        writer.append_line("line two").await.unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1);
        let contents = fs::read_to_string(dir.path().join(&names[0])).unwrap();
        assert_eq!(contents, "line one\nline two\n");
    }

    #[tokio::test]
    async fn reopening_continues_the_same_segment_when_under_the_limit() {
        let dir = tempdir().unwrap();
        {
            let writer = RotatingLogWriter::open(dir.path(), "requests", ".jsonl", 1024, 5).await.unwrap();
            writer.append_line("line one").await.unwrap();
        }
        let writer = RotatingLogWriter::open(dir.path(), "requests", ".jsonl", 1024, 5).await.unwrap();
        writer.append_line("line two").await.unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1, "expected a single continued segment, got {names:?}");
    }

    #[tokio::test]
    async fn rotates_when_segment_exceeds_threshold() {
        let dir = tempdir().unwrap();
        let writer = RotatingLogWriter::open(dir.path(), "requests", ".jsonl", 16, 5).await.unwrap();
        writer.append_line("this line alone exceeds sixteen bytes").await.unwrap();
        writer.append_line("next segment").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.ends_with(".jsonl.gz")));
        assert!(names.iter().any(|n| n.ends_with(".jsonl") && !n.ends_with(".jsonl.gz")));
    }

    #[tokio::test]
    async fn retention_caps_total_segment_count() {
        let dir = tempdir().unwrap();
        let writer = RotatingLogWriter::open(dir.path(), "requests", ".jsonl", 8, 2).await.unwrap();
        for i in 0..10 {
            writer.append_line(&format!("line number {i}")).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.len() <= 2, "expected at most max_files segments, got {names:?}");
    }
}
