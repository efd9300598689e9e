/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

// Reply sockets are counted per process, so this binary holds a single test.

use std::time::Duration;

use janus_rpc::prelude::*;
use tokio::net::UnixDatagram;

use crate::setup::*;

mod setup;

#[tokio::test]
async fn test_reply_sockets_removed_on_every_path() -> anyhow::Result<()> {
    let fixture = Fixture::start()?;
    let client = fixture.client()?;
    assert_eq!(leftover_reply_sockets(), 0);

    // Success.
    assert!(client.ping().await);
    assert_eq!(leftover_reply_sockets(), 0);

    // Server-side failure.
    let err = client.call("no_such_handler", None, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::HandlerNotFound);
    assert_eq!(leftover_reply_sockets(), 0);

    // Command timeout against a socket nobody reads.
    let silent_path = fixture.dir.path().join("silent.sock");
    let _silent = UnixDatagram::bind(&silent_path)?;
    let silent = JanusClient::new(&silent_path, "test", fixture.config.clone())?;
    let err = silent
        .call("ping", None, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::CommandTimeout);
    assert_eq!(leftover_reply_sockets(), 0);

    // Send failure.
    let missing = JanusClient::new(
        fixture.dir.path().join("missing.sock"),
        "test",
        fixture.config.clone(),
    )?;
    let err = missing.call("ping", None, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::SocketError);
    assert_eq!(leftover_reply_sockets(), 0);

    // Abandoned wait.
    let handle = silent.submit("ping", None, None).await?;
    assert_eq!(leftover_reply_sockets(), 1);
    assert_eq!(silent.pending_requests(), 1);
    drop(handle);
    assert_eq!(leftover_reply_sockets(), 0);
    assert_eq!(silent.pending_requests(), 0);
    Ok(())
}
