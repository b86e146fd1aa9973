// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Echo stream service: every byte received on an accepted stream is
//! written straight back. The daemon registers it so that freshly
//! deployed nodes have something to talk to.

use tracing::{debug, info};

use crate::node::service::{
    FailedConnection, ServiceHandler, ServiceSocket, SocketKind,
};

/// Service id of the echo stream.
pub const ECHO_SERVICE: u16 = 2;

/// Accepts echo streams from everyone.
#[derive(Debug, Default)]
pub struct EchoService;

impl ServiceHandler for EchoService {
    fn new_socket(&mut self, service: u16) -> Option<SocketKind> {
        (service == ECHO_SERVICE).then_some(SocketKind::Stream)
    }

    fn allow_connection(&mut self, service: u16, peer: &crate::models::peer::Node) -> bool {
        debug!(service, peer = %peer.id, "echo connection allowed");
        true
    }

    fn connection_started(&mut self, socket: ServiceSocket) {
        let ServiceSocket::Stream(stream) = socket else {
            return;
        };
        info!(peer = %stream.peer().id, "echo stream started");
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let n = stream.read_some(&mut buf).await;
                if n == 0 {
                    break;
                }
                let mut at = 0;
                while at < n {
                    match stream.write(&buf[at..n]).await {
                        Ok(0) => {
                            stream.writable().await;
                            if stream.is_closed() {
                                return;
                            }
                        },
                        Ok(written) => at += written,
                        Err(_) => return,
                    }
                }
            }
            debug!(peer = %stream.peer().id, "echo stream finished");
        });
    }

    fn connection_failed(&mut self, failed: FailedConnection) {
        debug!(service = failed.service, error = %failed.error,
               "echo connection failed");
    }
}
