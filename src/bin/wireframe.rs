use std::{
    error::Error,
    fs::File,
    io::{self, Read},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use log::info;

use wirebuf::{
    BufferPool, Decoder, Encoder, PipelineConfig, PoolConfig, ZReader, ZWriter,
    compress::{CHECKSUM_SIZE, DEFAULT_BLOCK_SIZE, FrameHeader, HEADER_SIZE, checksum, read_header},
    pool::DEFAULT_MEMORY_LIMIT,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Bytes the buffer pool may retain between uses
    #[arg(long, default_value_t = DEFAULT_MEMORY_LIMIT)]
    memory_limit: usize,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Wrap a file in LZ4 frames
    Compress {
        input: PathBuf,
        output: PathBuf,
        /// Uncompressed bytes per frame
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,
    },
    /// Unwrap a file of LZ4 frames
    Decompress { input: PathBuf, output: PathBuf },
    /// Print the header of every frame in a file
    Inspect { input: PathBuf },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let pool = BufferPool::new(PoolConfig {
        memory_limit: cli.memory_limit,
        ..PoolConfig::default()
    });

    match cli.action {
        Action::Compress {
            input,
            output,
            block_size,
        } => compress(&pool, input, output, block_size)?,
        Action::Decompress { input, output } => decompress(&pool, input, output)?,
        Action::Inspect { input } => inspect(&pool, input)?,
    }

    info!("pool retains {} bytes on exit", pool.retained_bytes());
    Ok(())
}

fn open(pool: &BufferPool, path: PathBuf) -> io::Result<ZReader> {
    ZReader::new(File::open(path)?, pool, PipelineConfig::default())
}

fn create(pool: &BufferPool, path: PathBuf) -> io::Result<ZWriter<File>> {
    ZWriter::new(File::create(path)?, pool, PipelineConfig::default())
}

fn compress(
    pool: &BufferPool,
    input: PathBuf,
    output: PathBuf,
    block_size: usize,
) -> Result<(), Box<dyn Error>> {
    let mut reader = open(pool, input)?;
    let mut encoder = Encoder::with_block_size(create(pool, output)?, pool, block_size);
    encoder.set_compress(true)?;

    let copied = io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.close()?;
    reader.close()?;

    info!("compressed {copied} bytes");
    Ok(())
}

fn decompress(pool: &BufferPool, input: PathBuf, output: PathBuf) -> Result<(), Box<dyn Error>> {
    let mut decoder = Decoder::new(open(pool, input)?, pool);
    decoder.set_compress(true);
    let mut writer = create(pool, output)?;

    let copied = io::copy(&mut decoder, &mut writer)?;
    writer.close()?;
    decoder.into_inner().close()?;

    info!("decompressed {copied} bytes");
    Ok(())
}

fn inspect(pool: &BufferPool, input: PathBuf) -> Result<(), Box<dyn Error>> {
    let mut reader = open(pool, input)?;
    let mut raw = [0_u8; HEADER_SIZE];
    let mut frames = 0;

    while read_header(&mut reader, &mut raw)? {
        let header = FrameHeader::parse(&raw)?;
        let mut frame = pool.get(HEADER_SIZE - CHECKSUM_SIZE + header.compressed_size, 0);
        frame[..HEADER_SIZE - CHECKSUM_SIZE].copy_from_slice(&raw[CHECKSUM_SIZE..]);
        reader.read_exact(&mut frame[HEADER_SIZE - CHECKSUM_SIZE..])?;

        let status = if checksum(&frame) == header.checksum {
            "ok"
        } else {
            "MISMATCH"
        };
        println!(
            "frame {frames}: method 0x{:02x}, compressed {}, decompressed {}, checksum {status}",
            header.method, header.compressed_size, header.decompressed_size
        );
        pool.put(frame);
        frames += 1;
    }

    reader.close()?;
    println!("{frames} frames");
    Ok(())
}
