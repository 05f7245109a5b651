//! Request/reply over channels. Each request carries its own reply
//! writer, so a server may accept new requests while replies are
//! pending, and a dead peer is always distinguishable from a slow one.

use crate::channel::channel;
use crate::error::Error;
use crate::microthread::descr;
use crate::{Reader, Writer};

/// Client half of an RPC pair; cheap to clone and share across
/// microthreads.
pub struct RpcClient<Req, Rep> {
    requests: Writer<(Req, Writer<Rep>)>,
}

impl<Req, Rep> Clone for RpcClient<Req, Rep> {
    fn clone(&self) -> Self {
        RpcClient {
            requests: self.requests.clone(),
        }
    }
}

impl<Req: Send + 'static, Rep: Send + 'static> RpcClient<Req, Rep> {
    /// Sends one request and blocks for its reply.
    pub fn call(&self, request: Req) -> Result<Rep, Error> {
        let (reply_w, reply_r) = channel();
        self.requests
            .send((request, reply_w))
            .map_err(|_| Error::RpcDead)?;
        reply_r.recv().map_err(|_| Error::RpcDead)
    }
}

/// Creates an RPC pair: the client handle and the server's request
/// reader.
pub fn rpc_channel<Req, Rep>() -> (RpcClient<Req, Rep>, Reader<(Req, Writer<Rep>)>)
where
    Req: Send + 'static,
    Rep: Send + 'static,
{
    let (requests, server) = channel();
    (RpcClient { requests }, server)
}

/// Serves requests with `f` until every client is gone. A caller that
/// gave up waiting only fails its own reply send.
pub fn rpc_server<Req, Rep, F>(requests: Reader<(Req, Writer<Rep>)>, mut f: F)
where
    Req: Send + 'static,
    Rep: Send + 'static,
    F: FnMut(Req) -> Rep,
{
    descr("chan::rpc_server");
    for (request, reply) in requests.iter() {
        let _ = reply.send(f(request));
    }
}
