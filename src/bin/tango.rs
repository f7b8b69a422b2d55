use std::io::{self, Read, Write};

use tango_tree::{FromSlice, TangoTree};

const CAPACITY: usize = 4096;

type Tree = TangoTree<CAPACITY>;

fn main() -> io::Result<()> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    let mut tokens = input.split_whitespace();

    let n: u32 = match tokens.next().and_then(|token| token.parse().ok()) {
        Some(n) if n >= 1 && (n as usize) < CAPACITY => n,
        _ => {
            eprintln!("expected a universe size between 1 and {}", CAPACITY - 1);
            std::process::exit(1);
        }
    };

    let mut buf = vec![0u8; std::mem::size_of::<Tree>()];
    let tree = Tree::new_from_slice(buf.as_mut_slice());
    tree.build(n);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    while let Some(op) = tokens.next() {
        match op {
            "1" => match tokens.next().and_then(|token| token.parse::<u64>().ok()) {
                Some(key) => {
                    tree.search(key);
                }
                None => writeln!(out, "Invalid operation")?,
            },
            "2" => write!(out, "{}", tree.show())?,
            _ => writeln!(out, "Invalid operation")?,
        }
    }
    Ok(())
}
