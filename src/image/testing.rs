//! Fixtures shared by the unit tests.

use crate::image::tool::ArchiveTool;
use image::{ImageBuffer, ImageFormat, Rgba};
use std::io::{Cursor, Write};
use std::path::Path;

/// A `/bin/sh` script standing in for `unzip`. The script sees the same
/// argv the real tool would: `-l <archive>` or `-p <archive> <member>`.
pub(crate) fn fake_tool(dir: &Path, body: &str) -> ArchiveTool {
    let script = dir.join("fake-unzip.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    ArchiveTool::new("/bin/sh").with_leading_args([script])
}

pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let buffer = ImageBuffer::from_pixel(width, height, Rgba([200u8, 10, 10, 255]));
    let mut out = Cursor::new(Vec::new());
    buffer.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// An `unzip -l` listing with the given `(length, name)` rows.
pub(crate) fn listing(rows: &[(u64, &str)]) -> String {
    let mut out = String::from("Archive:  book.cbz\n");
    out.push_str("  Length      Date    Time    Name\n");
    out.push_str("---------  ---------- -----   ----\n");
    for (length, name) in rows {
        out.push_str(&format!("{length:>9}  03-14-2024 09:26   {name}\n"));
    }
    out.push_str("---------                     -------\n");
    let total: u64 = rows.iter().map(|r| r.0).sum();
    out.push_str(&format!("{total:>9}                     {} files\n", rows.len()));
    out
}
