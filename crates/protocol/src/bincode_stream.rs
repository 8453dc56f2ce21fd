use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use tokio_util::{
    bytes::{Bytes, BytesMut},
    codec::{Decoder, Encoder, LengthDelimitedCodec},
};

pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Length-delimited frames, each carrying one bincode encoded `Item`.
pub struct BincodeCodec<Item> {
    inner: LengthDelimitedCodec,
    _tmp: PhantomData<Item>,
}

impl<Item> Default for BincodeCodec<Item> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_SIZE).new_codec(),
            _tmp: Default::default(),
        }
    }
}

impl<Item: Serialize> Encoder<Item> for BincodeCodec<Item> {
    type Error = bincode::Error;

    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let buf = bincode::serialize(&item)?;
        self.inner.encode(Bytes::from(buf), dst)?;
        Ok(())
    }
}

impl<Item: DeserializeOwned> Decoder for BincodeCodec<Item> {
    type Error = bincode::Error;
    type Item = Item;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(bincode::deserialize(&frame)?)),
            None => Ok(None),
        }
    }
}
