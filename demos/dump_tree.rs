use mpegts_fs::{Dentry, TsDemuxer};
use std::env;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;

fn print_tree(dentry: &Arc<Dentry>, depth: usize) {
    for child in dentry.children() {
        let indent = "  ".repeat(depth);
        if let Some(target) = child.symlink_target() {
            println!("{}{} -> {}", indent, child.name(), target);
        } else if let Some(content) = child.file_content() {
            match std::str::from_utf8(content) {
                Ok(text) => println!("{}{} = {}", indent, child.name(), text),
                Err(_) => println!("{}{} = <{} bytes>", indent, child.name(), content.len()),
            }
        } else {
            println!("{}{}/", indent, child.name());
            print_tree(&child, depth + 1);
        }
    }
}

fn main() {
    pretty_env_logger::init();
    let mut args = env::args();
    if args.len() < 2 {
        panic!("No file argument");
    }
    let file_path = args.nth(1).unwrap();

    let mut file = File::open(file_path).expect("unable to open!");
    let mut demuxer = TsDemuxer::new();
    let mut buffer = [0_u8; 64 * 188];
    loop {
        let read = file.read(&mut buffer).expect("IO Error!");
        if read == 0 {
            break;
        }
        demuxer.feed(&buffer[..read]);
    }

    let stats = demuxer.stats();
    eprintln!(
        "{} packets, {} sections, {} dropped",
        stats.packets, stats.sections, stats.dropped_sections
    );
    print_tree(&demuxer.root(), 0);
}
