use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use davmount::{memfs::MemFs, DavHandler};

#[tokio::main]
async fn main() {
    env_logger::init();
    let addr: SocketAddr = ([127, 0, 0, 1], 4918).into();

    let dav = DavHandler::builder()
        .filesystem(MemFs::new())
        .build_handler();

    let listener = TcpListener::bind(addr).await.unwrap();
    println!("Serving WebDAV on http://{}", addr);
    loop {
        let (stream, _client_addr) = listener.accept().await.unwrap();
        let dav = dav.clone();
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(move |req: hyper::Request<Incoming>| {
                let dav = dav.clone();
                async move { Ok::<_, Infallible>(dav.handle(req).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("error serving connection: {:?}", err);
            }
        });
    }
}
