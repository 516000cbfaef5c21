//! Integration tests for the transport layer
//!
//! These tests run block framing over a real loopback socket, the way
//! established streams use it.

#[cfg(test)]
mod tests {
    use std::io::{BufWriter, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use crate::protocol::Command;
    use crate::transport::{BlockReader, BlockWriter, WireReader, WireWriter};

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_commands_survive_socket_framing() {
        let (client, server) = socket_pair();

        let writer_thread = thread::spawn(move || {
            let mut writer = BlockWriter::new(BufWriter::new(client));
            for reqid in 1..=50u32 {
                let mut cmd = WireWriter::new();
                cmd.write_u16(Command::Ping.code());
                cmd.write_u32(reqid);
                writer.write_all(cmd.as_slice()).unwrap();
                writer.seal().unwrap();
                // an extra seal between commands must not produce an empty block
                writer.seal().unwrap();
            }
        });

        let mut reader = BlockReader::new(server);
        for expected in 1..=50u32 {
            let block = reader.read_block().unwrap().unwrap();
            let mut r = WireReader::new(&block);
            assert_eq!(Command::try_from(r.read_u16().unwrap()).unwrap(), Command::Ping);
            assert_eq!(r.read_u32().unwrap(), expected);
            assert!(r.is_exhausted());
        }
        writer_thread.join().unwrap();
        assert_eq!(reader.read_block().unwrap(), None);
    }

    #[test]
    fn test_concurrent_writers_interleave_only_at_block_boundaries() {
        use std::sync::{Arc, Mutex};

        let (client, server) = socket_pair();
        let writer = Arc::new(Mutex::new(BlockWriter::new(BufWriter::new(client))));

        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let writer = writer.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        let payload = vec![t; 1000];
                        writer.lock().unwrap().write_block(&payload).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        drop(writer);

        let mut reader = BlockReader::new(server);
        let mut count = 0;
        while let Some(block) = reader.read_block().unwrap() {
            assert_eq!(block.len(), 1000);
            assert!(block.iter().all(|b| *b == block[0]));
            count += 1;
        }
        assert_eq!(count, 100);
    }
}
