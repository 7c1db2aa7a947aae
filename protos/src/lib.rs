// Copyright 2024 Quarry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(clippy::all)]
// Wire-format structs carry every field the subset of the protocol we speak needs, and
// nothing else; unknown fields are skipped on decode.
#![allow(clippy::large_enum_variant)]

mod clients;
pub mod conversions;

///
/// The message and client types for the subset of the Bazel Remote Execution v2 protocol
/// this tool speaks, written out in the shape `tonic-build` generates. Field tags follow
/// the published protocol definitions; fields we never read or write are omitted (protobuf
/// decoders skip unknown fields, and omitted fields encode as their defaults).
///
pub mod gen {
    pub mod google {
        pub mod rpc {
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct Status {
                #[prost(int32, tag = "1")]
                pub code: i32,
                #[prost(string, tag = "2")]
                pub message: String,
                #[prost(message, repeated, tag = "3")]
                pub details: Vec<::prost_types::Any>,
            }
        }

        pub mod longrunning {
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct Operation {
                #[prost(string, tag = "1")]
                pub name: String,
                #[prost(message, optional, tag = "2")]
                pub metadata: Option<::prost_types::Any>,
                #[prost(bool, tag = "3")]
                pub done: bool,
                #[prost(oneof = "operation::Result", tags = "4, 5")]
                pub result: Option<operation::Result>,
            }

            pub mod operation {
                #[derive(Clone, PartialEq, ::prost::Oneof)]
                pub enum Result {
                    #[prost(message, tag = "4")]
                    Error(super::super::rpc::Status),
                    #[prost(message, tag = "5")]
                    Response(::prost_types::Any),
                }
            }
        }
    }

    pub mod build {
        pub mod bazel {
            pub mod remote {
                pub mod execution {
                    pub mod v2 {
                        use super::super::super::super::super::google;

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Digest {
                            #[prost(string, tag = "1")]
                            pub hash: String,
                            #[prost(int64, tag = "2")]
                            pub size_bytes: i64,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct FileNode {
                            #[prost(string, tag = "1")]
                            pub name: String,
                            #[prost(message, optional, tag = "2")]
                            pub digest: Option<Digest>,
                            #[prost(bool, tag = "4")]
                            pub is_executable: bool,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct DirectoryNode {
                            #[prost(string, tag = "1")]
                            pub name: String,
                            #[prost(message, optional, tag = "2")]
                            pub digest: Option<Digest>,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct SymlinkNode {
                            #[prost(string, tag = "1")]
                            pub name: String,
                            #[prost(string, tag = "2")]
                            pub target: String,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Directory {
                            #[prost(message, repeated, tag = "1")]
                            pub files: Vec<FileNode>,
                            #[prost(message, repeated, tag = "2")]
                            pub directories: Vec<DirectoryNode>,
                            #[prost(message, repeated, tag = "3")]
                            pub symlinks: Vec<SymlinkNode>,
                        }

                        pub mod command {
                            #[derive(Clone, PartialEq, ::prost::Message)]
                            pub struct EnvironmentVariable {
                                #[prost(string, tag = "1")]
                                pub name: String,
                                #[prost(string, tag = "2")]
                                pub value: String,
                            }
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Command {
                            #[prost(string, repeated, tag = "1")]
                            pub arguments: Vec<String>,
                            #[prost(message, repeated, tag = "2")]
                            pub environment_variables: Vec<command::EnvironmentVariable>,
                            #[prost(string, repeated, tag = "3")]
                            pub output_files: Vec<String>,
                            #[prost(string, repeated, tag = "4")]
                            pub output_directories: Vec<String>,
                            #[prost(string, tag = "6")]
                            pub working_directory: String,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Action {
                            #[prost(message, optional, tag = "1")]
                            pub command_digest: Option<Digest>,
                            #[prost(message, optional, tag = "2")]
                            pub input_root_digest: Option<Digest>,
                            #[prost(message, optional, tag = "6")]
                            pub timeout: Option<::prost_types::Duration>,
                            #[prost(bool, tag = "7")]
                            pub do_not_cache: bool,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct OutputFile {
                            #[prost(string, tag = "1")]
                            pub path: String,
                            #[prost(message, optional, tag = "2")]
                            pub digest: Option<Digest>,
                            #[prost(bool, tag = "4")]
                            pub is_executable: bool,
                            #[prost(bytes = "bytes", tag = "5")]
                            pub contents: ::bytes::Bytes,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct OutputDirectory {
                            #[prost(string, tag = "1")]
                            pub path: String,
                            #[prost(message, optional, tag = "2")]
                            pub tree_digest: Option<Digest>,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct Tree {
                            #[prost(message, optional, tag = "1")]
                            pub root: Option<Directory>,
                            #[prost(message, repeated, tag = "2")]
                            pub children: Vec<Directory>,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct ActionResult {
                            #[prost(message, repeated, tag = "2")]
                            pub output_files: Vec<OutputFile>,
                            #[prost(message, repeated, tag = "3")]
                            pub output_directories: Vec<OutputDirectory>,
                            #[prost(int32, tag = "4")]
                            pub exit_code: i32,
                            #[prost(bytes = "bytes", tag = "5")]
                            pub stdout_raw: ::bytes::Bytes,
                            #[prost(message, optional, tag = "6")]
                            pub stdout_digest: Option<Digest>,
                            #[prost(bytes = "bytes", tag = "7")]
                            pub stderr_raw: ::bytes::Bytes,
                            #[prost(message, optional, tag = "8")]
                            pub stderr_digest: Option<Digest>,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct ExecuteRequest {
                            #[prost(string, tag = "1")]
                            pub instance_name: String,
                            #[prost(bool, tag = "3")]
                            pub skip_cache_lookup: bool,
                            #[prost(message, optional, tag = "6")]
                            pub action_digest: Option<Digest>,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct ExecuteResponse {
                            #[prost(message, optional, tag = "1")]
                            pub result: Option<ActionResult>,
                            #[prost(bool, tag = "2")]
                            pub cached_result: bool,
                            #[prost(message, optional, tag = "3")]
                            pub status: Option<google::rpc::Status>,
                            #[prost(string, tag = "5")]
                            pub message: String,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct WaitExecutionRequest {
                            #[prost(string, tag = "1")]
                            pub name: String,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct GetActionResultRequest {
                            #[prost(string, tag = "1")]
                            pub instance_name: String,
                            #[prost(message, optional, tag = "2")]
                            pub action_digest: Option<Digest>,
                            #[prost(bool, tag = "3")]
                            pub inline_stdout: bool,
                            #[prost(bool, tag = "4")]
                            pub inline_stderr: bool,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct UpdateActionResultRequest {
                            #[prost(string, tag = "1")]
                            pub instance_name: String,
                            #[prost(message, optional, tag = "2")]
                            pub action_digest: Option<Digest>,
                            #[prost(message, optional, tag = "3")]
                            pub action_result: Option<ActionResult>,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct FindMissingBlobsRequest {
                            #[prost(string, tag = "1")]
                            pub instance_name: String,
                            #[prost(message, repeated, tag = "2")]
                            pub blob_digests: Vec<Digest>,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct FindMissingBlobsResponse {
                            #[prost(message, repeated, tag = "2")]
                            pub missing_blob_digests: Vec<Digest>,
                        }

                        pub mod batch_update_blobs_request {
                            use super::Digest;

                            #[derive(Clone, PartialEq, ::prost::Message)]
                            pub struct Request {
                                #[prost(message, optional, tag = "1")]
                                pub digest: Option<Digest>,
                                #[prost(bytes = "bytes", tag = "2")]
                                pub data: ::bytes::Bytes,
                            }
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct BatchUpdateBlobsRequest {
                            #[prost(string, tag = "1")]
                            pub instance_name: String,
                            #[prost(message, repeated, tag = "2")]
                            pub requests: Vec<batch_update_blobs_request::Request>,
                        }

                        pub mod batch_update_blobs_response {
                            use super::super::super::super::super::super::google;
                            use super::Digest;

                            #[derive(Clone, PartialEq, ::prost::Message)]
                            pub struct Response {
                                #[prost(message, optional, tag = "1")]
                                pub digest: Option<Digest>,
                                #[prost(message, optional, tag = "2")]
                                pub status: Option<google::rpc::Status>,
                            }
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct BatchUpdateBlobsResponse {
                            #[prost(message, repeated, tag = "1")]
                            pub responses: Vec<batch_update_blobs_response::Response>,
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct BatchReadBlobsRequest {
                            #[prost(string, tag = "1")]
                            pub instance_name: String,
                            #[prost(message, repeated, tag = "2")]
                            pub digests: Vec<Digest>,
                        }

                        pub mod batch_read_blobs_response {
                            use super::super::super::super::super::super::google;
                            use super::Digest;

                            #[derive(Clone, PartialEq, ::prost::Message)]
                            pub struct Response {
                                #[prost(message, optional, tag = "1")]
                                pub digest: Option<Digest>,
                                #[prost(bytes = "bytes", tag = "2")]
                                pub data: ::bytes::Bytes,
                                #[prost(message, optional, tag = "3")]
                                pub status: Option<google::rpc::Status>,
                            }
                        }

                        #[derive(Clone, PartialEq, ::prost::Message)]
                        pub struct BatchReadBlobsResponse {
                            #[prost(message, repeated, tag = "1")]
                            pub responses: Vec<batch_read_blobs_response::Response>,
                        }

                        pub use crate::clients::{
                            ActionCacheClient, ContentAddressableStorageClient, ExecutionClient,
                        };
                    }
                }
            }
        }
    }
}
