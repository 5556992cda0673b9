// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod ready;
pub mod task;

pub use self::{
    ready::{
        Callback,
        CallbackHandle,
        ReadyQueue,
        Work,
    },
    task::{
        SharedTask,
        TaskId,
    },
};
