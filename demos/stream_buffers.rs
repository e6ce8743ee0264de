//! A toy stream driver that keeps one sound RAM buffer per channel for each
//! open stream, the way an audio streaming layer would use the pool.
//!
//! Run with `RUST_LOG=debug` to see the splits and merges.

use sound_ram_allocator::{PoolError, SoundRamPool};

// Up to 8 streams of 2 channels each.
const MAX_STREAMS: usize = 8;
// Largest buffer an ADPCM stream channel may use.
const MAX_BUFFER: u32 = 32 * 1024;
// Sound CPU program and its stack live below this.
const RESERVE: u32 = 0x11000;

static POOL: SoundRamPool = SoundRamPool::new();

struct Stream {
    channels: Vec<u32>,
    buffer_size: u32,
}

impl Stream {
    /// Reserve `channels` buffers of `buffer_size` bytes, giving back whatever
    /// was reserved if any of them can't be had.
    fn open(channels: usize, buffer_size: u32) -> Result<Stream, PoolError> {
        let buffer_size = buffer_size.min(MAX_BUFFER);
        let mut stream = Stream {
            channels: Vec::with_capacity(channels),
            buffer_size,
        };
        for _ in 0..channels {
            match POOL.try_alloc(buffer_size)? {
                Some(offset) => stream.channels.push(offset),
                None => unreachable!("buffer size is never zero"),
            }
        }
        Ok(stream)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        for &offset in &self.channels {
            POOL.free(offset);
        }
    }
}

fn report(label: &str) {
    let (_, stats) = POOL.stats().expect("pool was initialized");
    println!(
        "{:<24} largest free {:>8} / total free {:>8} in {} extents",
        label, stats.largest_free, stats.free_bytes, stats.extents
    );
}

fn main() {
    env_logger::init();
    POOL.init(RESERVE).expect("pool is idle");
    report("after init");

    let mut streams: Vec<Stream> = Vec::new();
    for n in 0..MAX_STREAMS {
        let buffer_size = 8 * 1024 * (n as u32 % 4 + 1);
        match Stream::open(2, buffer_size) {
            Ok(stream) => {
                println!(
                    "stream {}: {} byte buffers at {:#x?}",
                    n, stream.buffer_size, stream.channels
                );
                streams.push(stream);
            }
            Err(err) => println!("stream {}: {}", n, err),
        }
    }
    report("all streams open");

    // Close every other stream; the holes stay separate because their
    // neighbours are still in use.
    let mut keep = true;
    streams.retain(|_| {
        keep = !keep;
        keep
    });
    report("half the streams closed");

    // A new small stream lands in the smallest hole that fits.
    if let Ok(stream) = Stream::open(2, 4 * 1024) {
        println!("small stream: buffers at {:#x?}", stream.channels);
        streams.push(stream);
    }
    report("small stream open");

    streams.clear();
    report("everything closed");

    POOL.shutdown().expect("pool is idle");
}
