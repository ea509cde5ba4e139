use {
    clap::Parser,
    std::path::PathBuf,
    styx::{io_err, res, srv::srv_listener},
    tokio::{fs, net::TcpListener},
};

mod store;
use crate::store::FileStore;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// Directory to export
    exportdir: PathBuf,

    /// TCP port to listen on
    port: u16,
}

async fn localfileserver_main(Cli { exportdir, port }: Cli) -> styx::Result<i32> {
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "export path must be a directory"));
    }
    let exportdir = fs::canonicalize(&exportdir).await?;

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    println!(
        "[*] Exporting {} on {}",
        exportdir.display(),
        listener.local_addr()?
    );

    srv_listener(FileStore::new(exportdir), listener)
        .await
        .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(1);
    });

    let exit_code = localfileserver_main(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use styx::{client::Client, fcall::om};

    async fn served() -> (tempfile::TempDir, Client<tokio::net::TcpStream>) {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(srv_listener(
            FileStore::new(dir.path().to_owned()),
            listener,
        ));

        let client = Client::connect(addr, "test", "").await.unwrap();
        (dir, client)
    }

    #[tokio::test]
    async fn create_write_clunk_reopen_read() {
        let (_dir, mut client) = served().await;

        client.create("x.txt", 0o644, om::WRITE).await.unwrap();

        let fid = client.open("x.txt", om::WRITE).await.unwrap();
        assert_eq!(client.write(fid, 0, b"hi").await.unwrap(), 2);
        client.clunk(fid).await.unwrap();

        let fid = client.open("x.txt", om::READ).await.unwrap();
        assert_eq!(client.read(fid, 0, 1024).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn mkdir_then_list_it() {
        let (_dir, mut client) = served().await;

        client.mkdir("sub", 0o755).await.unwrap();
        client.create("sub/a.txt", 0o644, om::WRITE).await.unwrap();

        let names: Vec<String> = client
            .ls("sub")
            .await
            .unwrap()
            .into_iter()
            .map(|stat| stat.name)
            .collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn remove_over_the_wire() {
        let (dir, mut client) = served().await;
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        client.remove("a.txt").await.unwrap();
        assert!(!dir.path().join("a.txt").exists());
    }
}
