mod bitstream;
mod cli;
mod crc;
mod cut;
mod error;
mod header;
mod id3;
mod index;
mod processor;
mod report;
mod scanner;
#[cfg(test)]
mod test_support;
mod track;
mod xing;

use anyhow::Result;

fn main() -> Result<()> {
    cli::run()
}
