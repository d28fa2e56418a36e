//! Reference-text ingestion: reading corpora from disk and building one model
//! from them.
//!
//! Plain files are read as UTF-8 text. `.gz` files are decompressed, and
//! `.tar`, `.tar.gz`/`.tgz` and `.zip` archives contribute every `.txt`
//! member they contain.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use rayon::prelude::*;
use tar::Archive;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::ModelError;
use crate::model::{BuildOptions, TextModel};
use crate::text;

/// Corpora larger than this are built in parallel chunks.
const LARGE_CORPUS_BYTES: usize = 500_000;
const CHUNK_SENTENCES: usize = 2_000;

fn read_text_from_reader<R: Read>(mut reader: R) -> Result<Vec<String>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    let text = String::from_utf8(buf).context("corpus is not valid UTF-8")?;
    Ok(non_blank(text))
}

fn non_blank(text: String) -> Vec<String> {
    if text.trim().is_empty() {
        Vec::new()
    } else {
        vec![text]
    }
}

fn is_text_member(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".txt")
}

fn collect_tar_texts<R: Read>(archive: &mut Archive<R>) -> Result<Vec<String>> {
    let mut texts = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        if !path.to_str().is_some_and(is_text_member) {
            continue;
        }

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        match String::from_utf8(buf) {
            Ok(text) => texts.extend(non_blank(text)),
            Err(_) => debug!(member = %path.display(), "skipping non UTF-8 archive member"),
        }
    }
    Ok(texts)
}

fn collect_zip_texts(archive: &mut ZipArchive<File>) -> Result<Vec<String>> {
    let mut texts = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() || !is_text_member(file.name()) {
            continue;
        }

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        match String::from_utf8(buf) {
            Ok(text) => texts.extend(non_blank(text)),
            Err(_) => debug!(member = file.name(), "skipping non UTF-8 archive member"),
        }
    }
    Ok(texts)
}

/// Read every text contained in `path`.
pub fn read_texts(path: &Path) -> Result<Vec<String>> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let open = || File::open(path).with_context(|| format!("failed to open {}", path.display()));

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return collect_tar_texts(&mut Archive::new(GzDecoder::new(open()?)));
    }
    if name.ends_with(".tar") {
        return collect_tar_texts(&mut Archive::new(open()?));
    }
    if name.ends_with(".zip") {
        let mut archive = ZipArchive::new(open()?)
            .with_context(|| format!("{} is not a zip archive", path.display()))?;
        return collect_zip_texts(&mut archive);
    }
    if name.ends_with(".gz") {
        return read_text_from_reader(GzDecoder::new(open()?));
    }

    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(non_blank(text))
}

/// Build one model from several texts. Large corpora are split into chunks
/// of sentences, built in parallel and merged.
pub fn build_model(texts: &[String], options: &BuildOptions) -> Result<TextModel, ModelError> {
    let total_bytes: usize = texts.iter().map(String::len).sum();
    if total_bytes <= LARGE_CORPUS_BYTES {
        let models = texts.iter().map(|text| TextModel::build(text, options));
        return TextModel::merge_all(options.state_size, models);
    }

    let sentences: Vec<&str> = texts
        .iter()
        .flat_map(|text| text::split_sentences(text))
        .collect();
    info!(
        bytes = total_bytes,
        sentences = sentences.len(),
        threads = rayon::current_num_threads(),
        "large corpus, building in parallel chunks"
    );

    sentences
        .par_chunks(CHUNK_SENTENCES)
        .map(|chunk| Ok(TextModel::build(&chunk.join("\n"), options)))
        .try_reduce(|| TextModel::empty(options.state_size), |a, b| a.merge(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DEFAULT_STATE_SIZE;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn reads_plain_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book");
        fs::write(&path, "Call me Ishmael.").unwrap();
        assert_eq!(read_texts(&path).unwrap(), vec!["Call me Ishmael."]);

        let blank = dir.path().join("blank.txt");
        fs::write(&blank, " \n ").unwrap();
        assert!(read_texts(&blank).unwrap().is_empty());
    }

    #[test]
    fn reads_gzip_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.txt.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"compressed words").unwrap();
        encoder.finish().unwrap();

        assert_eq!(read_texts(&path).unwrap(), vec!["compressed words"]);
    }

    #[test]
    fn reads_text_members_of_tar() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("books.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for (name, body) in [("a.txt", "first book"), ("b.bin", "skip me"), ("c.TXT", "second book")] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
        drop(builder);

        assert_eq!(read_texts(&path).unwrap(), vec!["first book", "second book"]);
    }

    #[test]
    fn reads_text_members_of_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("books.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        for (name, body) in [("a.txt", "zipped book"), ("notes.md", "skip me")] {
            writer
                .start_file(name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();

        assert_eq!(read_texts(&path).unwrap(), vec!["zipped book"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(read_texts(&dir.path().join("nope.txt")).is_err());
    }

    #[test]
    fn parallel_build_matches_sequential_build() {
        let mut corpus = String::new();
        let mut i = 0;
        while corpus.len() <= LARGE_CORPUS_BYTES {
            corpus.push_str(&format!("sentence number {} goes here. ", i % 97));
            i += 1;
        }
        let options = BuildOptions::default();

        let parallel = build_model(&[corpus.clone()], &options).unwrap();
        let sequential = TextModel::build(&corpus, &options);
        assert_eq!(parallel, sequential);
        assert_eq!(parallel.state_size(), DEFAULT_STATE_SIZE);
    }

    #[test]
    fn small_corpora_merge_every_text() {
        let texts = vec!["one two".to_string(), "one three".to_string()];
        let model = build_model(&texts, &BuildOptions::default()).unwrap();
        assert_eq!(model.corpus_size(), 2);
    }
}
