use std::io::{self, BufRead};

use tou::{Config, Connection};

fn main() {
    env_logger::init();

    println!(">>> Trying to connect to server...");
    let mut conn = Connection::connect("127.0.0.1:9090", Config::default()).unwrap();
    println!(">>> Connected from {}", conn.local_addr());

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap();
        if line.is_empty() {
            continue;
        }

        conn.send(line.as_bytes()).unwrap();
        let reply = conn.recv(line.len(), 1024).unwrap();

        println!("\n>>> Echo: {:?}\n", String::from_utf8_lossy(&reply));
    }

    conn.close().unwrap();
}
