use std::thread;
use std::time::Duration;

use tou::{Config, Host};

fn main() {
    env_logger::init();

    let host = Host::new("127.0.0.1:9090", 16, Config::default()).unwrap();
    println!(">>> Listening on {}", host.local_addr());

    loop {
        let Some(conn) = host.listen() else {
            thread::sleep(Duration::from_millis(50));
            continue;
        };

        println!(">>> Connection from {}", conn.peer_addr());
        thread::spawn(move || {
            let mut conn = conn;

            loop {
                match conn.recv(1, 1024) {
                    Ok(data) if data.is_empty() => break,
                    Ok(data) => {
                        println!("\n>>> Read: {:?}\n", String::from_utf8_lossy(&data));

                        if conn.send(&data).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            let _ = conn.close();
            println!(">>> Connection closed");
        });
    }
}
