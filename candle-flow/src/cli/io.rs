use candle_core::{Device, Tensor};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)?;
    match input_file.extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a plain file for writing, and return a buffered writer
/// * `output_file` - file name, or `stdout`
pub fn open_buf_writer(output_file: &Path) -> anyhow::Result<Box<dyn Write>> {
    if output_file.as_os_str().eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }
    Ok(Box::new(BufWriter::new(File::create(output_file)?)))
}

fn split_fields(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c == ',' || c == '\t' || c.is_whitespace())
        .filter(|w| !w.is_empty())
}

///
/// Read a numeric matrix, one row per line, fields separated by tabs,
/// commas or spaces. Empty lines and lines starting with `#` are skipped;
/// `nan` entries are kept.
///
pub fn read_matrix(path: &Path, device: &Device) -> anyhow::Result<Tensor> {
    let mut values: Vec<f32> = vec![];
    let mut ncols: Option<usize> = None;
    let mut nrows = 0;

    for (i, line) in open_buf_reader(path)?.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = split_fields(line)
            .map(|w| w.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("{}:{}: {}", path.display(), i + 1, e))?;
        match ncols {
            Some(n) if n != row.len() => anyhow::bail!(
                "{}:{}: {} field(s), expected {}",
                path.display(),
                i + 1,
                row.len(),
                n
            ),
            None => ncols = Some(row.len()),
            _ => {}
        }
        values.extend(row);
        nrows += 1;
    }

    let ncols = ncols.ok_or_else(|| anyhow::anyhow!("{} has no data", path.display()))?;
    info!("Read {} x {} matrix from {}", nrows, ncols, path.display());
    Ok(Tensor::from_vec(values, (nrows, ncols), device)?)
}

fn write_rows<W: Write>(rows: &[Vec<f32>], out: &mut W) -> std::io::Result<()> {
    for row in rows {
        let line = row
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(out, "{}", line)?;
    }
    Ok(())
}

/// Write a 2-d tensor as tab-separated rows, gzipped if `path` ends in `.gz`
pub fn write_matrix(x_nd: &Tensor, path: &Path) -> anyhow::Result<()> {
    let rows = x_nd.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
    match path.extension().and_then(|x| x.to_str()) {
        Some("gz") => {
            let file = BufWriter::new(File::create(path)?);
            let mut encoder = GzEncoder::new(file, Compression::default());
            write_rows(&rows, &mut encoder)?;
            // finish writes the gzip trailer
            encoder.finish()?.flush()?;
        }
        _ => {
            let mut out = open_buf_writer(path)?;
            write_rows(&rows, &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}
