// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// PAL: Platform Abstraction Layer
//======================================================================================================================

// This is the platform abstraction layer designed to hide the platform specific primitives that block plain threads.
// Fibers never block the OS thread, so only baton waits from outside a fiber reach this layer.

pub mod futex;
