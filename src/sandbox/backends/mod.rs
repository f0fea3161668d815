mod v8;

pub use self::v8::V8Backend;
