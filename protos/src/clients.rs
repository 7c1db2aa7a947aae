// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! gRPC clients for the remote-execution services, written out in the shape `tonic-build`
//! generates, specialised to `tonic::transport::Channel`.

use http::uri::PathAndQuery;
use tonic::codec::{ProstCodec, Streaming};
use tonic::transport::Channel;
use tonic::{IntoRequest, Response, Status};

use crate::gen::build::bazel::remote::execution::v2::{
    ActionResult, BatchReadBlobsRequest, BatchReadBlobsResponse, BatchUpdateBlobsRequest,
    BatchUpdateBlobsResponse, ExecuteRequest, FindMissingBlobsRequest, FindMissingBlobsResponse,
    GetActionResultRequest, UpdateActionResultRequest, WaitExecutionRequest,
};
use crate::gen::google::longrunning::Operation;

async fn ready(inner: &mut tonic::client::Grpc<Channel>) -> Result<(), Status> {
    inner
        .ready()
        .await
        .map_err(|e| Status::unknown(format!("Service was not ready: {e}")))
}

///
/// Client for `build.bazel.remote.execution.v2.Execution`.
///
#[derive(Clone, Debug)]
pub struct ExecutionClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ExecutionClient {
    pub fn new(channel: Channel) -> ExecutionClient {
        ExecutionClient {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn execute(
        &mut self,
        request: impl IntoRequest<ExecuteRequest>,
    ) -> Result<Response<Streaming<Operation>>, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<ExecuteRequest, Operation> = ProstCodec::default();
        let path = PathAndQuery::from_static(
            "/build.bazel.remote.execution.v2.Execution/Execute",
        );
        self.inner
            .server_streaming(request.into_request(), path, codec)
            .await
    }

    pub async fn wait_execution(
        &mut self,
        request: impl IntoRequest<WaitExecutionRequest>,
    ) -> Result<Response<Streaming<Operation>>, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<WaitExecutionRequest, Operation> = ProstCodec::default();
        let path = PathAndQuery::from_static(
            "/build.bazel.remote.execution.v2.Execution/WaitExecution",
        );
        self.inner
            .server_streaming(request.into_request(), path, codec)
            .await
    }
}

///
/// Client for `build.bazel.remote.execution.v2.ActionCache`.
///
#[derive(Clone, Debug)]
pub struct ActionCacheClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ActionCacheClient {
    pub fn new(channel: Channel) -> ActionCacheClient {
        ActionCacheClient {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn get_action_result(
        &mut self,
        request: impl IntoRequest<GetActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<GetActionResultRequest, ActionResult> = ProstCodec::default();
        let path = PathAndQuery::from_static(
            "/build.bazel.remote.execution.v2.ActionCache/GetActionResult",
        );
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn update_action_result(
        &mut self,
        request: impl IntoRequest<UpdateActionResultRequest>,
    ) -> Result<Response<ActionResult>, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<UpdateActionResultRequest, ActionResult> = ProstCodec::default();
        let path = PathAndQuery::from_static(
            "/build.bazel.remote.execution.v2.ActionCache/UpdateActionResult",
        );
        self.inner.unary(request.into_request(), path, codec).await
    }
}

///
/// Client for `build.bazel.remote.execution.v2.ContentAddressableStorage`.
///
#[derive(Clone, Debug)]
pub struct ContentAddressableStorageClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ContentAddressableStorageClient {
    pub fn new(channel: Channel) -> ContentAddressableStorageClient {
        ContentAddressableStorageClient {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn find_missing_blobs(
        &mut self,
        request: impl IntoRequest<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<FindMissingBlobsRequest, FindMissingBlobsResponse> =
            ProstCodec::default();
        let path = PathAndQuery::from_static(
            "/build.bazel.remote.execution.v2.ContentAddressableStorage/FindMissingBlobs",
        );
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn batch_update_blobs(
        &mut self,
        request: impl IntoRequest<BatchUpdateBlobsRequest>,
    ) -> Result<Response<BatchUpdateBlobsResponse>, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<BatchUpdateBlobsRequest, BatchUpdateBlobsResponse> =
            ProstCodec::default();
        let path = PathAndQuery::from_static(
            "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchUpdateBlobs",
        );
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn batch_read_blobs(
        &mut self,
        request: impl IntoRequest<BatchReadBlobsRequest>,
    ) -> Result<Response<BatchReadBlobsResponse>, Status> {
        ready(&mut self.inner).await?;
        let codec: ProstCodec<BatchReadBlobsRequest, BatchReadBlobsResponse> =
            ProstCodec::default();
        let path = PathAndQuery::from_static(
            "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchReadBlobs",
        );
        self.inner.unary(request.into_request(), path, codec).await
    }
}
