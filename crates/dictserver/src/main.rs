use {clap::Parser, styx::srv::srv_listener, tokio::net::TcpListener};

mod store;
use crate::store::DictStore;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// TCP port to listen on
    port: u16,
}

async fn dictserver_main(cli: Cli) -> styx::Result<i32> {
    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await?;
    println!("[*] Ready to accept clients: {}", listener.local_addr()?);

    srv_listener(DictStore::demo(), listener).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(1);
    });

    let exit_code = dictserver_main(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use styx::{
        client::Client,
        fcall::{MSIZE, om},
    };
    use tokio::net::TcpStream;

    async fn served() -> Client<TcpStream> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(srv_listener(DictStore::demo(), listener));

        Client::connect(addr, "inferno", "").await.unwrap()
    }

    #[tokio::test]
    async fn handshake_keeps_the_default_msize() {
        let client = served().await;
        assert_eq!(client.msize(), MSIZE);
    }

    #[tokio::test]
    async fn walk_open_read_hello() {
        let mut client = served().await;

        let fid = client.open("dir/hello.txt", om::READ).await.unwrap();
        let data = client.read(fid, 0, 8192).await.unwrap();
        assert_eq!(data, b"Hello world!\n");
    }

    #[tokio::test]
    async fn walk_past_the_end_does_not_bind_the_fid() {
        let mut client = served().await;

        assert!(client.walk("nope").await.is_err());

        // the same fid number is free again and walks fine elsewhere
        let fid = client.walk("dir").await.unwrap();
        client.clunk(fid).await.unwrap();
    }

    #[tokio::test]
    async fn listing_is_in_code_point_order() {
        let mut client = served().await;

        let names: Vec<String> = client
            .ls("dir")
            .await
            .unwrap()
            .into_iter()
            .map(|stat| stat.name)
            .collect();
        assert_eq!(names, vec!["hello.txt".to_owned(), "\u{263a}".to_owned()]);
    }

    #[tokio::test]
    async fn writes_come_back_read_only() {
        let mut client = served().await;

        let fid = client.open("dir/hello.txt", om::WRITE).await.unwrap();
        let err = client.write(fid, 0, b"x").await.unwrap_err();
        assert_eq!(err.ename(), "Read only.");
    }

    #[tokio::test]
    async fn unicode_file_reads_back() {
        let mut client = served().await;

        let fid = client.open("dir/\u{263a}", om::READ).await.unwrap();
        let data = client.read(fid, 0, 8192).await.unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), "Forståelse");
    }
}
