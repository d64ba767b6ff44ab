//! Shared test fixtures: schema files written into per-test temp dirs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const HW_PROTO: &str = r#"syntax = "proto3";
package ts;

import "google/protobuf/wrappers.proto";
import "google/protobuf/empty.proto";

service TSRest {
  rpc SayHello(HelloRequest) returns (HelloReply) {}
  rpc Compute(ComputeRequest) returns (ComputeReply) {}
  rpc RestEncodedJson(google.protobuf.StringValue) returns (google.protobuf.StringValue) {}
  rpc GetStatus(google.protobuf.Empty) returns (google.protobuf.BoolValue) {}
}

message HelloRequest {
  string name = 1;
}

message HelloReply {
  string message = 1;
}

message ComputeRequest {
  string rid = 1;
  string uuid = 2;
  string outlet = 3;
  string path = 4;
  bytes data = 5;
  string extra = 6;
}

message ComputeReply {
  int64 code = 1;
  string msg = 2;
}
"#;

pub const MESSAGING_PROTO: &str = r#"syntax = "proto3";
package messaging;

import "google/api/annotations.proto";

service Messaging {
  rpc GetMessage(GetMessageRequest) returns (Message) {
    option (google.api.http) = {
      get: "/v1/messages/{name=messages/*}"
    };
  }
  rpc SearchMessage(SearchMessageRequest) returns (Message) {
    option (google.api.http) = {
      get: "/v1/messages/filter/{name}"
    };
  }
  rpc UpdateMessage(UpdateMessageRequest) returns (Message) {
    option (google.api.http) = {
      put: "/v1/messages/{message_id}"
      body: "message"
    };
  }
  rpc PatchMessage(UpdateMessageRequest) returns (Message) {
    option (google.api.http) = {
      patch: "/v1/messages/{message_id}"
      body: "*"
    };
  }
  rpc CreateMessage(Message) returns (Message) {
    option (google.api.http) = {
      post: "/v1/messages"
      body: "*"
    };
  }
}

message GetMessageRequest {
  string name = 1;
}

message SearchMessageRequest {
  string name = 1;
  string revision = 2;
  SubMessage sub = 3;
}

message SubMessage {
  string subfield = 1;
}

message UpdateMessageRequest {
  string message_id = 1;
  Message message = 2;
}

message Message {
  string text = 1;
}
"#;

const HTTP_PROTO: &str = r#"syntax = "proto3";
package google.api;

message Http {
  repeated HttpRule rules = 1;
}

message HttpRule {
  string selector = 1;
  oneof pattern {
    string get = 2;
    string put = 3;
    string post = 4;
    string delete = 5;
    string patch = 6;
    CustomHttpPattern custom = 8;
  }
  string body = 7;
  repeated HttpRule additional_bindings = 11;
}

message CustomHttpPattern {
  string kind = 1;
  string path = 2;
}
"#;

const ANNOTATIONS_PROTO: &str = r#"syntax = "proto3";
package google.api;

import "google/api/http.proto";
import "google/protobuf/descriptor.proto";

extend google.protobuf.MethodOptions {
  HttpRule http = 72295728;
}
"#;

static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

/// A fresh directory under the system temp dir, unique per call.
pub fn unique_dir(label: &str) -> PathBuf {
    let seq = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "service-bridge-{label}-{}-{seq}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Writes the schema fixtures into `dir`.
pub fn write_schemas(dir: &Path) {
    std::fs::create_dir_all(dir.join("google/api")).unwrap();
    std::fs::write(dir.join("hw.proto"), HW_PROTO).unwrap();
    std::fs::write(dir.join("messaging.proto"), MESSAGING_PROTO).unwrap();
    std::fs::write(dir.join("google/api/http.proto"), HTTP_PROTO).unwrap();
    std::fs::write(dir.join("google/api/annotations.proto"), ANNOTATIONS_PROTO).unwrap();
}

/// A fresh directory pre-populated with the schema fixtures.
pub fn schema_dir() -> PathBuf {
    let dir = unique_dir("schemas");
    write_schemas(&dir);
    dir
}
