use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use portdisk::param::BSIZE;

const ZEROES: [u8; BSIZE] = [0; BSIZE];

/// Make a blank disk image for the virtio disk.
#[derive(Parser, Debug)]
struct Args {
    /// Name of the output img file
    diskname: PathBuf,

    /// Size of the disk, in blocks
    blocks: u32,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    mkdisk(&args.diskname, args.blocks)?;
    info!(
        "{}: {} blocks of {} bytes",
        args.diskname.display(),
        args.blocks,
        BSIZE
    );
    Ok(())
}

fn mkdisk(path: &Path, blocks: u32) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut img = BufWriter::new(file);
    for b in 0..blocks {
        img.write_all(&ZEROES)
            .with_context(|| format!("write block {} of {}", b, path.display()))?;
    }
    img.flush()
        .with_context(|| format!("flush {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_whole_zero_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.img");
        mkdisk(&path, 3).unwrap();

        let img = std::fs::read(&path).unwrap();
        assert_eq!(img.len(), 3 * BSIZE);
        assert!(img.iter().all(|&b| b == 0));
    }

    #[test]
    fn truncates_an_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.img");
        std::fs::write(&path, vec![0xff; 5 * BSIZE]).unwrap();

        mkdisk(&path, 1).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0; BSIZE]);
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no/such/fs.img");
        let err = mkdisk(&path, 1).unwrap_err();
        assert!(format!("{}", err).starts_with("create "));
    }

    #[test]
    fn parses_name_and_size() {
        let args = Args::try_parse_from(["mkdisk", "fs.img", "2000"]).unwrap();
        assert_eq!(args.diskname, PathBuf::from("fs.img"));
        assert_eq!(args.blocks, 2000);

        assert!(Args::try_parse_from(["mkdisk", "fs.img"]).is_err());
        assert!(Args::try_parse_from(["mkdisk", "fs.img", "-3"]).is_err());
    }
}
