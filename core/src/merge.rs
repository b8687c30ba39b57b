//! Merging sorted result files.
//!
//! Experiment pieces are text files whose lines are already sorted;
//! merging them is a k-way merge that keeps the combined output
//! sorted without ever holding a whole file in memory.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default name for a merged output file.
pub const DEFAULT_MERGE_OUTPUT: &str = "merged.dat";

/// Merges sorted line-oriented `inputs` into `output`.
///
/// Refuses to overwrite an existing output unless `force` is set.
/// With no inputs at all there is nothing to do and no output file is
/// created. Ties across inputs come out in input order.
pub fn merge_files(inputs: &[PathBuf], output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(Error::Usage(format!(
            "output file {} already exists and --force was not specified",
            output.display()
        )));
    }
    if inputs.is_empty() {
        return Ok(());
    }

    let mut readers: Vec<Lines<BufReader<File>>> = Vec::with_capacity(inputs.len());
    for path in inputs {
        let file = File::open(path).map_err(|e| {
            Error::Usage(format!("could not open input file {}: {e}", path.display()))
        })?;
        readers.push(BufReader::new(file).lines());
    }

    let mut writer = BufWriter::new(File::create(output)?);
    let mut heap: BinaryHeap<Reverse<(String, usize)>> = BinaryHeap::new();
    for (index, reader) in readers.iter_mut().enumerate() {
        if let Some(line) = reader.next() {
            heap.push(Reverse((line?, index)));
        }
    }
    while let Some(Reverse((line, index))) = heap.pop() {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        if let Some(next) = readers[index].next() {
            heap.push(Reverse((next?, index)));
        }
    }
    writer.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_inputs(dir: &Path, contents: &[&str]) -> Vec<PathBuf> {
        contents
            .iter()
            .enumerate()
            .map(|(i, content)| {
                let path = dir.join(format!("in-{i}.dat"));
                fs::write(&path, content).unwrap();
                path
            })
            .collect()
    }

    // -- Merge tests --

    #[test]
    fn merges_two_sorted_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = make_inputs(dir.path(), &["apple\ncherry\n", "banana\ndate\n"]);
        let output = dir.path().join("out.dat");

        merge_files(&inputs, &output, false).unwrap();

        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "apple\nbanana\ncherry\ndate\n"
        );
    }

    #[test]
    fn duplicate_lines_all_survive() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = make_inputs(dir.path(), &["same\n", "same\nzz\n"]);
        let output = dir.path().join("out.dat");

        merge_files(&inputs, &output, false).unwrap();

        assert_eq!(fs::read_to_string(&output).unwrap(), "same\nsame\nzz\n");
    }

    #[test]
    fn empty_inputs_contribute_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = make_inputs(dir.path(), &["", "only\n", ""]);
        let output = dir.path().join("out.dat");

        merge_files(&inputs, &output, false).unwrap();

        assert_eq!(fs::read_to_string(&output).unwrap(), "only\n");
    }

    #[test]
    fn no_inputs_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.dat");

        merge_files(&[], &output, false).unwrap();

        assert!(!output.exists());
    }

    // -- Guard tests --

    #[test]
    fn missing_input_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.dat");
        let missing = dir.path().join("nope.dat");

        let err = merge_files(&[missing.clone()], &output, false).unwrap_err();

        assert!(err.to_string().contains("nope.dat"));
    }

    #[test]
    fn existing_output_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = make_inputs(dir.path(), &["a\n"]);
        let output = dir.path().join("out.dat");
        fs::write(&output, "precious").unwrap();

        let err = merge_files(&inputs, &output, false).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
        assert_eq!(fs::read_to_string(&output).unwrap(), "precious");

        merge_files(&inputs, &output, true).unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "a\n");
    }
}
